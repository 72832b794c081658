//! Closed-loop heater control.
//!
//! Each heater owns a worker thread running the PID loop against a
//! temperature source and a power-control callback. The worker observes a
//! cancellation signal between samples; [`Heater::stop`] joins the worker
//! before writing the final zero power, so no control writes can happen after
//! it returns. A heater whose sensor stays unreadable past the timeout writes
//! zero and terminates itself.

mod pid;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use core_config::PidCoefficients;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use tracing::{error, info};

pub use pid::{FIX_ACCURACY, FIX_TIME_S, Pid};

/// Temperature source in Celsius. Errors are sensor failures.
pub type MeasureFn = Arc<dyn Fn() -> anyhow::Result<f64> + Send + Sync>;
/// Power sink, percent `0.0..=100.0`.
pub type ControlFn = Arc<dyn Fn(f64) + Send + Sync>;

/// Worker timing knobs. Production uses the defaults; tests shrink them.
#[derive(Debug, Clone, Copy)]
pub struct HeaterTuning {
    pub loop_interval: Duration,
    pub sensor_timeout: Duration,
    pub fix_time_s: f64,
    pub wait_poll: Duration,
}

impl Default for HeaterTuning {
    fn default() -> Self {
        Self {
            loop_interval: Duration::from_millis(500),
            sensor_timeout: Duration::from_secs(1),
            fix_time_s: FIX_TIME_S,
            wait_poll: Duration::from_millis(250),
        }
    }
}

/// Power/fix state shared with the worker. Power is stored as f64 bits to
/// keep the reader lock-free.
#[derive(Debug)]
struct Shared {
    fixed: AtomicU64,
    current_power: AtomicU64,
}

impl Shared {
    fn set_power(&self, percent: f64) {
        self.current_power.store(percent.to_bits(), Ordering::Relaxed);
    }

    fn power(&self) -> f64 {
        f64::from_bits(self.current_power.load(Ordering::Relaxed))
    }
}

pub struct Heater {
    shared: Arc<Shared>,
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
    control: ControlFn,
    measure: MeasureFn,
    target: f64,
    tuning: HeaterTuning,
}

impl Heater {
    /// Start the worker and begin heating toward `target` Celsius.
    pub fn spawn(
        target: f64,
        coefficients: PidCoefficients,
        tuning: HeaterTuning,
        measure: MeasureFn,
        control: ControlFn,
    ) -> Self {
        let shared = Arc::new(Shared {
            fixed: AtomicU64::new(0),
            current_power: AtomicU64::new(0),
        });
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let worker_shared = shared.clone();
        let worker_measure = measure.clone();
        let worker_control = control.clone();
        let handle = thread::Builder::new()
            .name("heater".into())
            .spawn(move || {
                run_worker(
                    target,
                    coefficients,
                    tuning,
                    worker_measure,
                    worker_control,
                    worker_shared,
                    stop_rx,
                );
            })
            .expect("spawn heater thread");
        info!(target: "heater", target_temperature = target, "heater_started");
        Self {
            shared,
            stop_tx,
            handle: Some(handle),
            control,
            measure,
            target,
            tuning,
        }
    }

    pub fn target_temperature(&self) -> f64 {
        self.target
    }

    /// True once the PID has reached the target and held it.
    pub fn is_fixed(&self) -> bool {
        self.shared.fixed.load(Ordering::Relaxed) != 0
    }

    /// Block until the target temperature is reached and held, logging
    /// progress. Returns early if the worker died (sensor failure).
    pub fn wait(&self) {
        let mut i = 0u32;
        while !self.is_fixed() {
            if self.handle.as_ref().is_none_or(|h| h.is_finished()) {
                return;
            }
            if i % 8 == 0 {
                let current = (self.measure)().ok();
                info!(
                    target: "heater",
                    current_temperature = current,
                    power_percent = self.shared.power() as i64,
                    "heating"
                );
            }
            i += 1;
            thread::sleep(self.tuning.wait_poll);
        }
    }

    /// Stop heating. After this returns the control callback has received a
    /// final zero and will never be called again.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let _ = self.stop_tx.send(());
        let _ = handle.join();
        (self.control)(0.0);
        info!(target: "heater", "heater_stopped");
    }
}

impl Drop for Heater {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(
    target: f64,
    coefficients: PidCoefficients,
    tuning: HeaterTuning,
    measure: MeasureFn,
    control: ControlFn,
    shared: Arc<Shared>,
    stop_rx: Receiver<()>,
) {
    let started = Instant::now();
    let mut pid = Pid::new(target, &coefficients, 0.0).with_fix_time(tuning.fix_time_s);
    let mut failing_since: Option<Instant> = None;
    loop {
        match stop_rx.recv_timeout(tuning.loop_interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        match measure() {
            Ok(current) => {
                failing_since = None;
                let power = pid.update(current, started.elapsed().as_secs_f64()) * 100.0;
                shared.set_power(power);
                shared
                    .fixed
                    .store(pid.is_fixed() as u64, Ordering::Relaxed);
                control(power);
            }
            Err(err) => {
                control(0.0);
                shared.set_power(0.0);
                let since = *failing_since.get_or_insert_with(Instant::now);
                if since.elapsed() > tuning.sensor_timeout {
                    error!(
                        target: "heater",
                        ?err,
                        "no data from temperature sensor, stop heating"
                    );
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::AtomicU32;

    fn fast_tuning() -> HeaterTuning {
        HeaterTuning {
            loop_interval: Duration::from_millis(1),
            sensor_timeout: Duration::from_millis(20),
            fix_time_s: 0.0,
            wait_poll: Duration::from_millis(1),
        }
    }

    fn coefficients() -> PidCoefficients {
        core_config::MachineConfig::default().file.temperature.extruder_pid
    }

    fn counting_control() -> (ControlFn, Arc<AtomicU32>) {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let control: ControlFn = Arc::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (control, counter)
    }

    fn steady_measure(value: f64) -> MeasureFn {
        Arc::new(move || Ok(value))
    }

    #[test]
    fn start_stop_makes_no_further_control_calls() {
        let (control, counter) = counting_control();
        let heater = Heater::spawn(
            100.0,
            coefficients(),
            fast_tuning(),
            steady_measure(100.0),
            control,
        );
        assert_eq!(heater.target_temperature(), 100.0);
        heater.stop();
        let after_stop = counter.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn asynchronous_loop_reaches_fixed_state() {
        let (control, counter) = counting_control();
        let heater = Heater::spawn(
            100.0,
            coefficients(),
            fast_tuning(),
            steady_measure(100.0),
            control,
        );
        let mut guard = 0;
        while counter.load(Ordering::SeqCst) < 3 {
            thread::sleep(Duration::from_millis(10));
            guard += 1;
            assert!(guard < 500, "heater worker never ran");
        }
        assert!(heater.is_fixed());
        heater.stop();
    }

    #[test]
    fn wait_blocks_until_fixed() {
        let (control, counter) = counting_control();
        let heater = Heater::spawn(
            100.0,
            coefficients(),
            fast_tuning(),
            steady_measure(100.0),
            control,
        );
        heater.wait();
        assert!(heater.is_fixed());
        heater.stop();
        assert!(counter.load(Ordering::SeqCst) > 1);
    }

    #[test]
    fn wrong_temperature_never_fixes() {
        let (control, counter) = counting_control();
        let heater = Heater::spawn(
            100.0,
            coefficients(),
            fast_tuning(),
            steady_measure(50.0),
            control,
        );
        let mut guard = 0;
        while counter.load(Ordering::SeqCst) < 10 {
            thread::sleep(Duration::from_millis(10));
            guard += 1;
            assert!(guard < 500, "heater worker never ran");
        }
        assert!(!heater.is_fixed());
        heater.stop();
    }

    #[test]
    fn failing_sensor_terminates_the_worker_with_zero_power() {
        let failures = Arc::new(AtomicU32::new(0));
        let f = failures.clone();
        let measure: MeasureFn = Arc::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("sensor gone"))
        });
        let (control, _counter) = counting_control();
        let heater = Heater::spawn(100.0, coefficients(), fast_tuning(), measure, control);
        let mut guard = 0;
        while !heater.handle.as_ref().unwrap().is_finished() {
            thread::sleep(Duration::from_millis(5));
            guard += 1;
            assert!(guard < 500, "worker should stop after the sensor timeout");
        }
        assert!(failures.load(Ordering::SeqCst) >= 1);
        // wait() must not hang on a dead worker
        heater.wait();
        assert!(!heater.is_fixed());
        heater.stop();
    }
}
