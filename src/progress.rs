use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

/// Progress bar that also prints every tracing log line above itself.
#[derive(Clone)]
pub struct TracingProgressBar {
    progress: indicatif::ProgressBar,
}

impl TracingProgressBar {
    /// Creates the bar and installs it as the writer of the global tracing
    /// subscriber.
    pub fn init(len: u64) -> Self {
        let style = indicatif::ProgressStyle::default_bar().template(
            "[{elapsed_precise}] {wide_bar:.green} {pos:>2}/{len:2} (ETA {eta})",
        );
        let progress = indicatif::ProgressBar::new(len);
        progress.set_style(style);
        let progress = Self { progress };

        // redirect all tracing logs to self; this makes sure there's a single
        // progress bar, and not one scattered in between log lines
        let installed = tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_writer(progress.clone())
            .try_init();
        if installed.is_err() {
            tracing::debug!("tracing subscriber already installed");
        }
        progress
    }

    /// A bar that never draws.
    pub fn hidden() -> Self {
        Self {
            progress: indicatif::ProgressBar::hidden(),
        }
    }

    pub fn set_length(&self, len: u64) {
        self.progress.set_length(len);
        self.progress.set_position(0);
    }

    pub fn inc(&self) {
        self.progress.inc(1);
    }

    pub fn position(&self) -> u64 {
        self.progress.position()
    }

    pub fn finish(&self) {
        self.progress.finish();
    }
}

impl std::io::Write for TracingProgressBar {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        // `println` adds its own newline
        let line = String::from_utf8_lossy(buf);
        self.progress.println(line.trim_end_matches('\n'));
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for TracingProgressBar {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Filter from `RUST_LOG`, `info` when unset.
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs a plain fmt subscriber, for runs without a progress bar.
pub fn init_tracing() {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .try_init();
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hidden_bar_counts() {
        let progress = TracingProgressBar::hidden();
        progress.set_length(3);
        progress.inc();
        progress.inc();
        assert_eq!(progress.position(), 2);
        progress.set_length(1);
        assert_eq!(progress.position(), 0);
        progress.finish();
    }
}
