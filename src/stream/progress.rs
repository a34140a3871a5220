/// Client side of the reply stream: progress bars and log relay
use super::{HubReply, LogLevel};
use crate::agent::ServiceStatus;
use crate::error::{HubError, HubResult};
use fnv::FnvHashMap;
use futures::{Stream, StreamExt};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tracing::{debug, error, info, warn};

const BAR_TEMPLATE: &str = "{msg} [{bar:40}] {pos}/{len}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarState {
    Running,
    Complete,
    Aborted,
}

struct Bar {
    current: u32,
    total: u32,
    state: BarState,
    bar: Option<ProgressBar>,
}

/// One counter per progress label.
///
/// The first update for a label creates its bar with the given total, later
/// updates advance it by one. A bar that reached its total stays complete.
pub struct ProgressTracker {
    bars: FnvHashMap<String, Bar>,
    multi: Option<MultiProgress>,
}

impl ProgressTracker {
    /// Tracker drawing bars on the terminal
    pub fn new() -> Self {
        Self {
            bars: FnvHashMap::default(),
            multi: Some(MultiProgress::with_draw_target(ProgressDrawTarget::stdout())),
        }
    }

    /// Tracker that only counts
    pub fn hidden() -> Self {
        Self {
            bars: FnvHashMap::default(),
            multi: None,
        }
    }

    pub fn observe(&mut self, label: &str, total: u32) {
        match self.bars.get_mut(label) {
            None => {
                let bar = self.multi.as_ref().map(|multi| {
                    let style = ProgressStyle::default_bar()
                        .template(BAR_TEMPLATE)
                        .unwrap_or_else(|_| ProgressStyle::default_bar());
                    let bar = multi.add(ProgressBar::new(u64::from(total)));
                    bar.set_style(style);
                    bar.set_message(label.to_string());
                    bar
                });
                let state = if total == 0 {
                    BarState::Complete
                } else {
                    BarState::Running
                };
                self.bars.insert(
                    label.to_string(),
                    Bar {
                        current: 0,
                        total,
                        state,
                        bar,
                    },
                );
            }
            Some(entry) => {
                if entry.state != BarState::Running {
                    return;
                }
                entry.current += 1;
                if let Some(bar) = &entry.bar {
                    bar.inc(1);
                }
                if entry.current >= entry.total {
                    entry.state = BarState::Complete;
                    if let Some(bar) = &entry.bar {
                        bar.finish();
                    }
                }
            }
        }
    }

    /// Abandon every bar still running
    pub fn abort_all(&mut self) {
        for entry in self.bars.values_mut() {
            if entry.state == BarState::Running {
                entry.state = BarState::Aborted;
                if let Some(bar) = &entry.bar {
                    bar.abandon();
                }
            }
        }
    }

    pub fn state(&self, label: &str) -> Option<BarState> {
        self.bars.get(label).map(|entry| entry.state)
    }

    /// Current count and total of a bar
    pub fn position(&self, label: &str) -> Option<(u32, u32)> {
        self.bars.get(label).map(|entry| (entry.current, entry.total))
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain a reply stream until it ends, rendering progress and relaying log
/// and stdout frames. Returns the statuses carried by the stream, if any.
pub async fn consume_stream<S>(
    mut replies: S,
    tracker: &mut ProgressTracker,
) -> HubResult<Vec<ServiceStatus>>
where
    S: Stream<Item = HubResult<HubReply>> + Unpin,
{
    let mut statuses = Vec::new();

    while let Some(reply) = replies.next().await {
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                tracker.abort_all();
                return Err(e);
            }
        };

        match reply {
            HubReply::Log { message, level } => match level {
                LogLevel::Debug => debug!("{}", message),
                LogLevel::Info => info!("{}", message),
                LogLevel::Warning => warn!("{}", message),
                LogLevel::Error | LogLevel::Fatal => error!("{}", message),
            },
            HubReply::Stdout { text } => print!("{}", text),
            HubReply::Progress { label, total } => tracker.observe(&label, total),
            HubReply::Statuses { statuses: s } => statuses.extend(s),
            HubReply::Done => return Ok(statuses),
            HubReply::Error { message } => {
                tracker.abort_all();
                return Err(HubError::Stream { message });
            }
        }
    }

    Ok(statuses)
}
