use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::level_filters::LevelFilter;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Environment variable holding `EnvFilter` directives.
pub const LOG_ENV: &str = "SVN_GIT_EMIT_LOG";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
    Trace,
}

impl Verbosity {
    fn level(self) -> LevelFilter {
        match self {
            Verbosity::Quiet => LevelFilter::WARN,
            Verbosity::Normal => LevelFilter::INFO,
            Verbosity::Verbose => LevelFilter::DEBUG,
            Verbosity::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Debug, Default)]
struct Counts {
    warnings: AtomicUsize,
    errors: AtomicUsize,
}

/// Counts warning and error events so the exit status can reflect the worst
/// one seen.
#[derive(Clone, Debug, Default)]
pub struct SeverityCounter(Arc<Counts>);

impl SeverityCounter {
    pub fn warnings(&self) -> usize {
        self.0.warnings.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> usize {
        self.0.errors.load(Ordering::Relaxed)
    }

    pub fn worst(&self) -> Option<Level> {
        if self.errors() > 0 {
            Some(Level::ERROR)
        } else if self.warnings() > 0 {
            Some(Level::WARN)
        } else {
            None
        }
    }
}

impl<S: Subscriber> Layer<S> for SeverityCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        match *event.metadata().level() {
            Level::ERROR => {
                self.0.errors.fetch_add(1, Ordering::Relaxed);
            }
            Level::WARN => {
                self.0.warnings.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

/// Install the global subscriber: compact lines on stderr, filtered by
/// `SVN_GIT_EMIT_LOG` or else by `verbosity`.
pub fn init(verbosity: Verbosity) -> SeverityCounter {
    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.level().into())
        .with_env_var(LOG_ENV)
        .from_env_lossy();
    let counter = SeverityCounter::default();

    let fmt = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(false)
        .with_writer(std::io::stderr);

    let installed = Registry::default()
        .with(filter)
        .with(fmt)
        .with(counter.clone())
        .try_init();
    if let Err(e) = installed {
        eprintln!("svn-git-emit: logging already initialized: {e}");
    }
    counter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_worst_severity() {
        let counter = SeverityCounter::default();
        let subscriber = Registry::default().with(counter.clone());
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("fine");
            assert_eq!(counter.worst(), None);
            tracing::warn!("careful");
            assert_eq!(counter.worst(), Some(Level::WARN));
            tracing::error!("broken");
        });
        assert_eq!(counter.warnings(), 1);
        assert_eq!(counter.errors(), 1);
        assert_eq!(counter.worst(), Some(Level::ERROR));
    }
}
