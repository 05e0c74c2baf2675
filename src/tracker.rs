//! Process-scoped tracker: owns the dispatcher and produces the shutdown report exactly once.

use std::{
    fs::{self, File},
    io::{self, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use log::{debug, info, warn};

use crate::{
    config::Config,
    dispatch::{Dispatcher, RealAllocator, Unwinder},
    error::ReportError,
    guard,
    report::{LeakReport, MemoryView},
    stats::Statistics,
};

#[derive(Debug)]
pub struct Tracker<A> {
    dispatcher: Dispatcher<A>,
    config: Config,
    reported: AtomicBool,
}

impl<A: RealAllocator> Tracker<A> {
    pub fn new(real: A, unwinder: Option<Box<dyn Unwinder>>, config: Config) -> Self {
        if unwinder.is_none() {
            warn!("stack unwinder not available, leak callers will not be reported");
        }
        let stats = Arc::new(Statistics::new());
        let dispatcher = Dispatcher::new(real, stats, unwinder, &config);
        debug!("allocation tracker created: {:?}", config);
        Tracker {
            dispatcher,
            config,
            reported: AtomicBool::new(false),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher<A> {
        &self.dispatcher
    }

    pub fn stats(&self) -> &Arc<Statistics> {
        self.dispatcher.stats()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Starts tracking; called when the profiled program reaches its entry point.
    pub fn enter_main(&self) {
        info!("entering main, allocation tracking enabled");
        self.dispatcher.enter_main();
    }

    /// Captures a report of the allocations that are still live.
    pub fn report(&self, memory: &dyn MemoryView) -> LeakReport {
        let _suppressed = guard::suppress();
        let mut report = LeakReport::capture(self.stats(), memory);
        report.resolve_symbols();
        report
    }

    /// Writes the shutdown report to the configured destinations.  Only the first call does
    /// anything; later calls return `Ok(None)`.
    pub fn teardown(&self, memory: &dyn MemoryView) -> Result<Option<LeakReport>, ReportError> {
        if self.reported.swap(true, Ordering::AcqRel) {
            return Ok(None);
        }
        let _suppressed = guard::suppress();
        let report = self.report(memory);
        info!(
            "{} leaks, {} bytes leaked",
            report.leak_count(),
            report.leaked_bytes()
        );

        match &self.config.output {
            Some(path) => {
                let mut file = File::create(path)?;
                write_report(&report, &mut file)?;
                info!("leak report written to {}", path.display());
            }
            None => write_report(&report, &mut io::stdout().lock())?,
        }

        if let Some(path) = self.config.dump_path() {
            let yaml = serde_yaml::to_string(&report)?;
            fs::write(&path, yaml).map_err(|source| ReportError::Dump {
                path: path.clone(),
                source,
            })?;
            info!("report dump written to {}", path.display());
        }

        Ok(Some(report))
    }
}

pub fn write_report<W: Write>(report: &LeakReport, out: &mut W) -> Result<(), ReportError> {
    write!(out, "{}", report)?;
    out.flush()?;
    Ok(())
}
