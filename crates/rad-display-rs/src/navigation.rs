use rad_core::NavigationTarget;
use std::process::Stdio;
use tokio::{process::Command, runtime::Handle};
use tracing::{debug, info, warn};

/// The one thing the display core may ask of the window shell.
///
/// Implementations must not block: `navigate` is called while the display's
/// state lock is held.
pub trait NavigationSink: Send + Sync {
    fn navigate(&self, target: &NavigationTarget);
}

/// Headless sink, only records the navigation in the log.
pub struct LogSink;

impl NavigationSink for LogSink {
    fn navigate(&self, target: &NavigationTarget) {
        info!(event = "navigate", url = %target.url, default = target.is_default());
    }
}

/// Hands every URL to an external command, e.g. a kiosk browser's remote
/// control. The URL is appended as the last argument.
#[derive(Debug, Clone)]
pub struct CommandSink {
    program: String,
    args: Vec<String>,
}

impl CommandSink {
    pub fn parse(command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl NavigationSink for CommandSink {
    fn navigate(&self, target: &NavigationTarget) {
        let Ok(runtime) = Handle::try_current() else {
            warn!(event = "navigate_no_runtime", url = %target.url);
            return;
        };
        let spawned = Command::new(&self.program)
            .args(&self.args)
            .arg(&target.url)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match spawned {
            Ok(mut child) => {
                info!(event = "navigate", url = %target.url, default = target.is_default());
                let program = self.program.clone();
                runtime.spawn(async move {
                    match child.wait().await {
                        Ok(status) if !status.success() => {
                            warn!(event = "navigate_command_failed", program = %program, status = %status);
                        }
                        Ok(_) => debug!(event = "navigate_command_done", program = %program),
                        Err(err) => warn!(event = "navigate_command_wait_error", program = %program, error = %err),
                    }
                });
            }
            Err(err) => {
                warn!(event = "navigate_spawn_error", program = %self.program, url = %target.url, error = %err);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        targets: Mutex<Vec<NavigationTarget>>,
    }

    impl RecordingSink {
        pub(crate) fn targets(&self) -> Vec<NavigationTarget> {
            self.targets.lock().expect("sink lock").clone()
        }

        pub(crate) fn urls(&self) -> Vec<String> {
            self.targets().into_iter().map(|target| target.url).collect()
        }
    }

    impl NavigationSink for RecordingSink {
        fn navigate(&self, target: &NavigationTarget) {
            self.targets.lock().expect("sink lock").push(target.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_splits_program_and_args() {
        let sink = CommandSink::parse("  kiosk-ctl --screen 1 navigate ").expect("sink");
        assert_eq!(sink.program(), "kiosk-ctl");
        assert_eq!(sink.args(), ["--screen", "1", "navigate"]);
        assert!(CommandSink::parse("   ").is_none());
    }

    #[test]
    fn command_sink_without_runtime_does_not_panic() {
        let sink = CommandSink::parse("true").expect("sink");
        sink.navigate(&NavigationTarget::transient("http://hub.local/energy"));
    }

    #[tokio::test]
    async fn command_sink_tolerates_missing_program() {
        let sink = CommandSink::parse("rad-definitely-not-installed").expect("sink");
        sink.navigate(&NavigationTarget::default_view("http://hub.local/lovelace"));
    }
}
