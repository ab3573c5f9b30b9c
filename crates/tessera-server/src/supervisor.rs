//! The supervisor.
//!
//! Owns the object graph's teardown: components register shutdown
//! callbacks as they come up, and on exit the callbacks fire in
//! reverse registration order — consumers stop before the things they
//! consume.

use std::fmt::Write as _;
use std::sync::Mutex;

use tracing::info;

type Callback = Box<dyn FnOnce() + Send>;
type StatusFn = Box<dyn Fn(&mut String) + Send>;

#[derive(Default)]
pub struct Supervisor {
    shutdown: Mutex<Vec<(String, Callback)>>,
    status: Mutex<Vec<(String, StatusFn)>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a shutdown callback; fired in reverse order.
    pub fn on_shutdown(&self, name: impl Into<String>, callback: impl FnOnce() + Send + 'static) {
        self.shutdown
            .lock()
            .expect("supervisor lock")
            .push((name.into(), Box::new(callback)));
    }

    /// Registers a status reporter for SIGUSR1 dumps.
    pub fn on_status(&self, name: impl Into<String>, f: impl Fn(&mut String) + Send + 'static) {
        self.status
            .lock()
            .expect("supervisor lock")
            .push((name.into(), Box::new(f)));
    }

    /// Runs every shutdown callback, newest first.
    pub fn run_shutdown(&self) {
        let mut callbacks = self.shutdown.lock().expect("supervisor lock");
        while let Some((name, callback)) = callbacks.pop() {
            info!(component = %name, "shutting down");
            callback();
        }
    }

    /// Collects the status tree.
    pub fn collect_status(&self) -> String {
        let mut out = String::new();
        for (name, f) in self.status.lock().expect("supervisor lock").iter() {
            let _ = writeln!(out, "{name}:");
            f(&mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn shutdown_runs_in_reverse_order() {
        let supervisor = Supervisor::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));

        for name in ["store", "manager", "dispatchers"] {
            let order = order.clone();
            let counter = counter.clone();
            supervisor.on_shutdown(name, move || {
                order.lock().unwrap().push(name);
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        supervisor.run_shutdown();

        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(
            *order.lock().unwrap(),
            vec!["dispatchers", "manager", "store"]
        );

        // Second run is a no-op.
        supervisor.run_shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn status_collects_all_reporters() {
        let supervisor = Supervisor::new();
        supervisor.on_status("vars", |out| out.push_str("- Active vars: 0\n"));
        supervisor.on_status("acceptors", |out| out.push_str("- Acceptors: 0\n"));
        let report = supervisor.collect_status();
        assert!(report.contains("vars:"));
        assert!(report.contains("acceptors:"));
        assert!(report.contains("Active vars"));
    }
}
