//! Terminal visualization consumer: follows the shared selection and shows the
//! live store's recent values for each selected topic.
//!
//! The selection file is polled through a [`SelectionWatcher`]; a change
//! rebuilds the panel list. Values are re-read from the live store on every
//! refresh. Uses `crossterm` directly (alternate screen, cursor positioning,
//! colors); the layout is a fixed list redrawn by polling.

#![allow(missing_docs)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crossterm::cursor::MoveTo;
use crossterm::event::{self, Event, KeyCode, KeyModifiers};
use crossterm::style::{Attribute, Color, SetAttribute, SetForegroundColor};
use crossterm::terminal::{self, Clear, ClearType, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::{execute, queue};

use crate::core::config::{Config, StatusConfig};
use crate::logger::activity::ActivityLoggerHandle;
use crate::registry::status::{Status, classify};
use crate::registry::topics::{TopicRegistry, topic_label};
use crate::selection::channel::SelectionChannel;
use crate::selection::watcher::SelectionWatcher;
use crate::store::sqlite::ReadingStore;

/// Unicode block characters for sparkline rendering (8 levels).
const SPARK_CHARS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

/// Readings kept per panel.
const HISTORY_LEN: u32 = 30;

fn status_color(status: Status) -> Color {
    match status {
        Status::Occupied | Status::High => Color::Red,
        Status::Low => Color::Blue,
        Status::Normal | Status::Unoccupied => Color::Green,
        Status::NoData | Status::Unknown => Color::DarkGrey,
    }
}

/// Render a sparkline from values already normalized to 0..=1.
fn render_sparkline(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| {
            let idx = (v.clamp(0.0, 1.0) * 7.0).round() as usize;
            SPARK_CHARS[idx.min(7)]
        })
        .collect()
}

/// Min-max normalize; a flat series sits in the middle.
fn normalize(values: &[f64]) -> Vec<f64> {
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;
    if !range.is_finite() || range == 0.0 {
        return vec![0.5; values.len()];
    }
    values.iter().map(|v| (v - min) / range).collect()
}

/// Settings for [`run`].
pub struct WatchConfig {
    pub selection_file: PathBuf,
    pub selection_mode: crate::core::config::SelectionMode,
    pub live_db: PathBuf,
    pub refresh: Duration,
    pub thresholds: StatusConfig,
    pub registry: TopicRegistry,
}

impl WatchConfig {
    /// Watch settings from the loaded configuration.
    #[must_use]
    pub fn from_config(config: &Config, registry: TopicRegistry) -> Self {
        Self {
            selection_file: config.paths.selection_file.clone(),
            selection_mode: config.selection.mode,
            live_db: config.paths.live_db.clone(),
            refresh: Duration::from_millis(config.selection.poll_interval_ms),
            thresholds: config.status.clone(),
            registry,
        }
    }
}

/// One selected topic as displayed.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicPanel {
    pub topic: String,
    pub values: Vec<f64>,
    pub latest_at: Option<String>,
    pub status: Status,
}

impl TopicPanel {
    #[must_use]
    pub fn latest(&self) -> Option<f64> {
        self.values.last().copied()
    }
}

/// Build one panel per selected topic from the store's recent rows.
///
/// A missing store or a failed query shows the topic as having no data.
#[must_use]
pub fn build_panels(
    store: Option<&ReadingStore>,
    selection: &[String],
    thresholds: &StatusConfig,
) -> Vec<TopicPanel> {
    selection
        .iter()
        .map(|topic| {
            let rows = store
                .and_then(|s| s.recent_by_topic(topic, HISTORY_LEN).ok())
                .unwrap_or_default();
            let values: Vec<f64> = rows.iter().map(|r| r.value).collect();
            TopicPanel {
                topic: topic.clone(),
                status: classify(topic, values.last().copied(), thresholds),
                latest_at: rows.last().map(|r| r.timestamp.clone()),
                values,
            }
        })
        .collect()
}

/// Run until the user exits (q/Esc/Ctrl-C).
pub fn run(config: &WatchConfig) -> io::Result<()> {
    let mut stdout = io::stdout();

    terminal::enable_raw_mode()?;
    execute!(stdout, EnterAlternateScreen)?;

    let result = run_inner(&mut stdout, config);

    // Always restore terminal state.
    let _ = execute!(stdout, LeaveAlternateScreen);
    let _ = terminal::disable_raw_mode();

    result
}

fn run_inner(stdout: &mut io::Stdout, config: &WatchConfig) -> io::Result<()> {
    let channel = SelectionChannel::new(
        &config.selection_file,
        config.selection_mode,
        ActivityLoggerHandle::disabled(),
    );
    let mut watcher = SelectionWatcher::new(channel);
    let mut selection: Vec<String> = Vec::new();
    let mut changes = 0u64;
    let mut store: Option<ReadingStore> = None;

    let mut last_render: Option<Instant> = None;

    loop {
        if event::poll(Duration::from_millis(50))?
            && let Event::Key(key) = event::read()?
        {
            match key.code {
                KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
                KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                    return Ok(());
                }
                _ => {}
            }
        }

        if last_render.is_some_and(|at| at.elapsed() < config.refresh) {
            continue;
        }
        last_render = Some(Instant::now());

        if let Some(next) = watcher.poll() {
            selection = next;
            changes += 1;
        }
        if store.is_none() {
            store = ReadingStore::open(&config.live_db).ok();
        }

        let panels = build_panels(store.as_ref(), &selection, &config.thresholds);
        let entities = config.registry.entities_for_selection(&selection);
        let (cols, _) = terminal::size()?;
        render_frame(
            stdout,
            cols as usize,
            &FrameInfo {
                selection_file: &config.selection_file,
                store_open: store.is_some(),
                changes,
                entities: entities.len(),
            },
            &panels,
        )?;
    }
}

struct FrameInfo<'a> {
    selection_file: &'a std::path::Path,
    store_open: bool,
    changes: u64,
    entities: usize,
}

fn render_frame(
    stdout: &mut io::Stdout,
    width: usize,
    info: &FrameInfo<'_>,
    panels: &[TopicPanel],
) -> io::Result<()> {
    let mut row = 0u16;
    queue!(stdout, MoveTo(0, 0), Clear(ClearType::All))?;

    let mode = if info.store_open { "LIVE" } else { "NO STORE" };
    let header = format!(" SmartLab twin v{}  [{mode}]", env!("CARGO_PKG_VERSION"));
    let right = format!("selection changes: {} ", info.changes);
    let pad = width.saturating_sub(header.len() + right.len() + 4);
    queue!(
        stdout,
        MoveTo(0, row),
        SetForegroundColor(Color::Cyan),
        SetAttribute(Attribute::Bold),
    )?;
    write!(stdout, "┌─{header}{:─<pad$}{right}─┐", "")?;
    queue!(stdout, SetAttribute(Attribute::Reset))?;
    row += 2;

    queue!(stdout, MoveTo(3, row), SetForegroundColor(Color::DarkGrey))?;
    write!(
        stdout,
        "{}  ({} linked entities)",
        info.selection_file.display(),
        info.entities
    )?;
    queue!(stdout, SetAttribute(Attribute::Reset))?;
    row += 2;

    if panels.is_empty() {
        queue!(stdout, MoveTo(3, row), SetForegroundColor(Color::DarkGrey))?;
        write!(stdout, "(nothing selected)")?;
        queue!(stdout, SetAttribute(Attribute::Reset))?;
        row += 1;
    }

    let label_width = width.saturating_sub(60).clamp(16, 40);
    for panel in panels {
        let label = topic_label(&panel.topic);
        queue!(stdout, MoveTo(3, row), SetForegroundColor(Color::White))?;
        write!(stdout, "{label:<label_width$.label_width$}")?;

        let spark = render_sparkline(&normalize(&panel.values));
        let latest = panel
            .latest()
            .map_or_else(|| "--".to_string(), |v| format!("{v:.1}"));
        queue!(stdout, SetForegroundColor(status_color(panel.status)))?;
        write!(stdout, " {spark:<30} {latest:>8}  {}", panel.status)?;
        if let Some(at) = &panel.latest_at {
            queue!(stdout, SetForegroundColor(Color::DarkGrey))?;
            let time = at.split('T').nth(1).unwrap_or(at);
            write!(stdout, "  @{time}")?;
        }
        queue!(stdout, SetAttribute(Attribute::Reset))?;
        row += 1;
    }

    row += 1;
    let footer = " Press q or Esc to exit ";
    let pad = width.saturating_sub(footer.len() + 4);
    queue!(stdout, MoveTo(0, row), SetForegroundColor(Color::Cyan))?;
    write!(stdout, "└─{footer}{:─<pad$}──┘", "")?;
    queue!(stdout, SetAttribute(Attribute::Reset))?;

    stdout.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::tests::{reading, temp_store};

    const CO2: &str = "KNX/13/0/0<Livingroom.Sensors.CO2-ppm>";

    #[test]
    fn sparkline_renders_extremes() {
        let spark = render_sparkline(&[0.0, 0.5, 1.0]);
        assert_eq!(spark.chars().count(), 3);
        assert_eq!(spark.chars().next(), Some('▁'));
        assert_eq!(spark.chars().last(), Some('█'));
    }

    #[test]
    fn normalize_flat_and_ranged() {
        assert_eq!(normalize(&[21.0, 21.0]), vec![0.5, 0.5]);
        assert_eq!(normalize(&[10.0, 15.0, 20.0]), vec![0.0, 0.5, 1.0]);
        assert!(normalize(&[]).is_empty());
    }

    #[test]
    fn panels_follow_selection_order_and_classify() {
        let (_dir, store) = temp_store();
        store.write(&reading(CO2, 0, 410.0)).unwrap();
        store.write(&reading(CO2, 1, 455.0)).unwrap();

        let selection = vec!["missing".to_string(), CO2.to_string()];
        let panels = build_panels(Some(&store), &selection, &StatusConfig::default());

        assert_eq!(panels.len(), 2);
        assert_eq!(panels[0].topic, "missing");
        assert_eq!(panels[0].status, Status::NoData);
        assert_eq!(panels[1].values, vec![410.0, 455.0]);
        assert_eq!(panels[1].latest(), Some(455.0));
        assert_eq!(panels[1].status, Status::Occupied);
        assert_eq!(panels[1].latest_at.as_deref(), Some("2024-11-05T14:00:01"));
    }

    #[test]
    fn panels_without_store_have_no_data() {
        let panels = build_panels(None, &[CO2.to_string()], &StatusConfig::default());
        assert_eq!(panels[0].status, Status::NoData);
        assert!(panels[0].values.is_empty());
    }

    #[test]
    fn status_colors() {
        assert_eq!(status_color(Status::Occupied), Color::Red);
        assert_eq!(status_color(Status::Normal), Color::Green);
        assert_eq!(status_color(Status::NoData), Color::DarkGrey);
    }
}
