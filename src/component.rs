//! Sort component
//!
//! Owns the device resources and a dedicated worker thread, the only context that
//! submits work to the device. Callers never block: [`SortComponent::request_sort`]
//! flips the state machine to `Executing`, stores the view position in a
//! single-slot mailbox and wakes the worker, which then runs the whole dispatch
//! sequence synchronously.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info, trace};

use crate::capture;
use crate::config::SortConfig;
use crate::device::ComputeDevice;
use crate::error::SortError;
use crate::geometry::SortGeometry;
use crate::params::{ConstantParameters, Element};
use crate::resources::DeviceResources;
use crate::scheduler::{PassScheduler, RunOutcome};
use crate::state::{ExecutionState, ExecutionStateMachine};

/// State shared between callers and the worker.
#[derive(Debug, Default)]
struct Shared {
    machine: ExecutionStateMachine,
    view_position: Mutex<[f32; 4]>,
    save_requested: AtomicBool,
    completed_sorts: AtomicU64,
    last_error: Mutex<Option<String>>,
}

enum Command {
    Stage(Vec<Element>),
    Run,
    Shutdown,
}

/// GPU bitonic sort of a fixed-size surface.
pub struct SortComponent<D: ComputeDevice> {
    shared: Arc<Shared>,
    commands: Sender<Command>,
    worker: Option<JoinHandle<()>>,
    surface: D::SurfaceHandle,
    geometry: SortGeometry,
}

impl<D: ComputeDevice> SortComponent<D> {
    /// Create a component sorting [`SortGeometry::STANDARD`].
    pub fn create(config: &SortConfig, device: D) -> Result<Self, SortError> {
        Self::create_with_geometry(config, SortGeometry::STANDARD, device)
    }

    /// Create a component for a reduced network, e.g. in tests.
    pub fn create_with_geometry(
        config: &SortConfig,
        geometry: SortGeometry,
        mut device: D,
    ) -> Result<Self, SortError> {
        geometry.validate()?;
        if !config.feature_level.supports_compute() {
            return Err(SortError::UnsupportedFeatureLevel(config.feature_level));
        }
        if config.surface_width != geometry.matrix_width()
            || config.surface_height != geometry.matrix_height()
        {
            return Err(SortError::SurfaceSize {
                width: config.surface_width,
                height: config.surface_height,
                expected_width: geometry.matrix_width(),
                expected_height: geometry.matrix_height(),
            });
        }

        let staging = vec![Element::UNSET; geometry.num_elements() as usize];
        let resources = DeviceResources::allocate(
            &mut device,
            &geometry,
            config.surface_width,
            config.surface_height,
            &staging,
        )?;
        let surface = device.surface_handle(resources.surface());
        info!(
            "Using compute device: {} ({} elements, {} dispatches per sort)",
            device.name(),
            geometry.num_elements(),
            geometry.dispatch_count()
        );

        let shared = Arc::new(Shared::default());
        let worker = Worker {
            device,
            resources,
            staging,
            scheduler: PassScheduler::new(geometry),
            constants: ConstantParameters {
                simulation_speed: config.simulation_speed,
            },
            screenshot_dir: config.screenshot_dir.clone(),
            shared: Arc::clone(&shared),
        };

        let (commands, receiver) = crossbeam_channel::unbounded();
        let handle = thread::Builder::new()
            .name("bitonic-sort".into())
            .spawn(move || worker.run(receiver))
            .map_err(SortError::WorkerSpawn)?;

        Ok(SortComponent {
            shared,
            commands,
            worker: Some(handle),
            surface,
            geometry,
        })
    }

    /// Request one sort with the given view position.
    ///
    /// Ignored while a sort is in flight or once unloading has begun.
    pub fn request_sort(&self, view_position: [f32; 4]) {
        if !self.shared.machine.try_begin() {
            trace!("sort request dropped in state {:?}", self.shared.machine.state());
            return;
        }
        *lock(&self.shared.view_position) = view_position;
        if self.commands.send(Command::Run).is_err() {
            error!("sort worker is gone; request lost");
            self.shared.machine.complete();
        }
    }

    /// Capture the surface after the next completed sort.
    pub fn request_save(&self) {
        self.shared.save_requested.store(true, Ordering::SeqCst);
    }

    /// Copy `records` into the start of the staging array for the next sort.
    ///
    /// # Panics
    ///
    /// Panics if more records are supplied than the network sorts.
    pub fn set_input_data<R: Copy + Into<Element>>(&self, records: &[R]) {
        assert!(
            records.len() <= self.geometry.num_elements() as usize,
            "input of {} records exceeds the {} sortable elements",
            records.len(),
            self.geometry.num_elements()
        );
        let records = records.iter().map(|&record| record.into()).collect();
        if self.commands.send(Command::Stage(records)).is_err() {
            error!("sort worker is gone; input data lost");
        }
    }

    /// Handle to the sorted surface for downstream consumers.
    pub fn surface_handle(&self) -> D::SurfaceHandle {
        self.surface.clone()
    }

    pub fn geometry(&self) -> &SortGeometry {
        &self.geometry
    }

    pub fn state(&self) -> ExecutionState {
        self.shared.machine.state()
    }

    /// Sorts that ran every dispatch to completion.
    pub fn completed_sorts(&self) -> u64 {
        self.shared.completed_sorts.load(Ordering::SeqCst)
    }

    /// Why the most recent run failed. Cleared by the next completed sort.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared.last_error).clone()
    }

    /// Wait until the worker has finished every accepted sort, including one still
    /// dispatching after [`begin_unload`](Self::begin_unload). Returns `false` on
    /// timeout.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        self.shared.machine.wait_until_settled(timeout)
    }

    /// Enter `Unloading`: later requests are ignored and an in-flight sort stops
    /// before its next dispatch. Dropping the component does this too.
    pub fn begin_unload(&self) {
        if self.shared.machine.begin_teardown() {
            debug!("sort component unloading");
        }
    }
}

impl<D: ComputeDevice> Drop for SortComponent<D> {
    fn drop(&mut self) {
        self.begin_unload();
        let _ = self.commands.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("sort worker panicked");
            }
        }
    }
}

/// The single consumer of the command queue. Owns the device and its resources.
struct Worker<D: ComputeDevice> {
    device: D,
    resources: DeviceResources<D>,
    staging: Vec<Element>,
    scheduler: PassScheduler,
    constants: ConstantParameters,
    screenshot_dir: PathBuf,
    shared: Arc<Shared>,
}

impl<D: ComputeDevice> Worker<D> {
    fn run(mut self, commands: Receiver<Command>) {
        for command in commands.iter() {
            match command {
                Command::Stage(records) => {
                    self.staging[..records.len()].copy_from_slice(&records);
                }
                Command::Run => {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.execute()));
                    if let Err(payload) = outcome {
                        let reason = format!("sort worker panicked: {}", panic_message(&*payload));
                        error!("{}", reason);
                        *lock(&self.shared.last_error) = Some(reason);
                    }
                    self.shared.machine.complete();
                }
                Command::Shutdown => break,
            }
        }

        self.resources.release_views();
        debug!("sort worker stopped; releasing surface and buffers");
        // Dropping `self` releases the surface and both buffers.
    }

    fn execute(&mut self) {
        if self.shared.machine.is_unloading() {
            self.resources.release_views();
            return;
        }

        let view_position = *lock(&self.shared.view_position);
        match self.sort(view_position) {
            Ok(RunOutcome::Completed { dispatches }) => {
                self.shared.completed_sorts.fetch_add(1, Ordering::SeqCst);
                lock(&self.shared.last_error).take();
                debug!("sort finished after {} dispatches", dispatches);
                if self.shared.save_requested.swap(false, Ordering::SeqCst) {
                    self.save();
                }
            }
            Ok(RunOutcome::Aborted { dispatches }) => {
                debug!("sort abandoned for unload after {} dispatches", dispatches);
                self.resources.release_views();
            }
            Err(e) => {
                error!("sort failed: {}", e);
                *lock(&self.shared.last_error) = Some(e.to_string());
            }
        }
    }

    fn sort(&mut self, view_position: [f32; 4]) -> Result<RunOutcome, SortError> {
        let Worker {
            device,
            resources,
            staging,
            scheduler,
            constants,
            shared,
            ..
        } = self;
        let views = resources.views().ok_or(SortError::ViewsReleased)?;

        device.write_buffer(resources.staging(), bytemuck::cast_slice(staging.as_slice()))?;
        device.clear_view(views.scratch, 0)?;
        device.seed_surface(resources.staging(), resources.surface())?;

        scheduler.run(device, &views, constants, view_position, || {
            shared.machine.is_unloading()
        })
    }

    fn save(&mut self) {
        let surface = self.resources.surface();
        if let Err(e) = capture::capture_surface(&mut self.device, surface, &self.screenshot_dir) {
            error!("Failed to save BMP: {}", e);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
