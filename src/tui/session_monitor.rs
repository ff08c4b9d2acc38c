//! TUI for watching a check session with live progress

use crate::orchestrator::api::Api;
use crate::orchestrator::progress::ProgressView;
use crate::orchestrator::session::{BatchStatus, SessionOptions};
use crate::Result;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Alignment, Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Gauge, List, ListItem, Paragraph, Wrap},
    Frame, Terminal,
};
use std::io;
use std::time::Instant;
use tokio::time::Duration;

/// How often the monitor polls the progress aggregator
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Session monitor TUI application state
pub struct SessionMonitorApp {
    api: Api,
    opts: SessionOptions,
    /// The session being watched (None until started, or when there was
    /// nothing to check)
    session_id: Option<String>,
    /// Latest polled progress
    view: Option<ProgressView>,
    /// Status message
    status_message: String,
    /// Whether the run has reached a terminal state
    is_finished: bool,
    /// Whether the user wants to quit
    should_quit: bool,
}

impl SessionMonitorApp {
    pub fn new(api: Api, opts: SessionOptions) -> Self {
        Self {
            api,
            opts,
            session_id: None,
            view: None,
            status_message: "Starting check run... Press 'q' to quit, 'c' to cancel.".to_string(),
            is_finished: false,
            should_quit: false,
        }
    }

    /// Run the TUI application
    pub async fn run(&mut self) -> Result<()> {
        // Setup terminal
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;

        let result = self.run_app(&mut terminal).await;

        // Restore terminal
        disable_raw_mode()?;
        execute!(
            terminal.backend_mut(),
            LeaveAlternateScreen,
            DisableMouseCapture
        )?;
        terminal.show_cursor()?;

        result
    }

    async fn run_app<B: Backend>(&mut self, terminal: &mut Terminal<B>) -> Result<()> {
        let reply = self.api.start(self.opts.clone()).await;
        if !reply.success {
            self.status_message = format!(
                "Could not start: {} | Press 'q' to quit",
                reply.error.unwrap_or_else(|| "unknown error".to_string())
            );
            self.is_finished = true;
        } else if reply.session_id.is_none() {
            self.status_message = "No matching proxies to check. Press 'q' to quit.".to_string();
            self.is_finished = true;
        } else {
            self.session_id = reply.session_id;
        }

        let mut last_poll: Option<Instant> = None;

        loop {
            terminal.draw(|f| self.ui(f))?;

            // Handle key events with a short timeout
            if event::poll(Duration::from_millis(50))? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press {
                        self.handle_input(key.code).await;
                        if self.should_quit {
                            break;
                        }
                    }
                }
            }

            if last_poll.map_or(true, |t| t.elapsed() >= POLL_INTERVAL) {
                self.poll_progress().await;
                last_poll = Some(Instant::now());
            }
        }

        Ok(())
    }

    async fn poll_progress(&mut self) {
        let Some(session_id) = self.session_id.clone() else {
            return;
        };

        let reply = self.api.progress(&session_id).await;
        if !reply.success {
            self.status_message = format!(
                "Progress poll failed: {}",
                reply.error.unwrap_or_else(|| "unknown error".to_string())
            );
            return;
        }

        if let Some(view) = reply.progress {
            if view.is_finished && !self.is_finished {
                self.is_finished = true;
                self.status_message = format!(
                    "{} Checked: {} | Online: {} | Offline: {} | Press 'q' to quit",
                    if view.is_complete {
                        "Complete!"
                    } else if view.cancelled {
                        "Cancelled."
                    } else {
                        "Finished with failed batches."
                    },
                    view.total_checked,
                    view.total_online,
                    view.total_offline,
                );
            } else if !self.is_finished {
                self.status_message = format!(
                    "Checking... {}% ({}/{}) | Online: {} | Offline: {} | Batches {}/{} active {}",
                    view.overall_progress,
                    view.total_checked,
                    view.total_proxies,
                    view.total_online,
                    view.total_offline,
                    view.completed_batches,
                    view.total_batches,
                    view.active_batches,
                );
            }
            self.view = Some(view);
        }
    }

    async fn handle_input(&mut self, key: KeyCode) {
        match key {
            KeyCode::Char('q') | KeyCode::Esc => {
                self.should_quit = true;
            }
            KeyCode::Char('c') => {
                if let Some(session_id) = self.session_id.clone() {
                    let reply = self.api.cancel(&session_id).await;
                    self.status_message = if reply.success {
                        "Cancellation requested; waiting for running batches to stop...".to_string()
                    } else {
                        format!(
                            "Cancel failed: {}",
                            reply.error.unwrap_or_else(|| "unknown error".to_string())
                        )
                    };
                }
            }
            _ => {}
        }
    }

    fn ui(&mut self, f: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .margin(1)
            .constraints([
                Constraint::Length(3), // Title
                Constraint::Length(3), // Progress bar
                Constraint::Min(0),    // Batches + summary
                Constraint::Length(3), // Status bar
            ])
            .split(f.size());

        // Title
        let title = Paragraph::new("Proxy Watch - Check Run")
            .style(Style::default().fg(Color::Cyan))
            .alignment(Alignment::Center)
            .block(Block::default().borders(Borders::ALL));
        f.render_widget(title, chunks[0]);

        // Progress bar
        let percent = self
            .view
            .as_ref()
            .map(|v| v.overall_progress as u16)
            .unwrap_or(0);
        let progress_label = match &self.view {
            Some(v) => format!("{}/{} ({}%)", v.total_checked, v.total_proxies, percent),
            None => "starting".to_string(),
        };
        let gauge = Gauge::default()
            .block(Block::default().borders(Borders::ALL).title("Progress"))
            .gauge_style(Style::default().fg(Color::Green).bg(Color::Black))
            .percent(percent)
            .label(progress_label);
        f.render_widget(gauge, chunks[1]);

        // Batch list on the left, session summary on the right
        let panes = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
            .split(chunks[2]);

        let items: Vec<ListItem> = self
            .view
            .as_ref()
            .map(|v| {
                v.batch_statuses
                    .iter()
                    .map(|b| {
                        let color = match b.status {
                            BatchStatus::Pending => Color::DarkGray,
                            BatchStatus::Running => Color::Yellow,
                            BatchStatus::Completed => Color::Green,
                            BatchStatus::Failed => Color::Red,
                        };
                        ListItem::new(format!("batch {:>3}  {}", b.batch_id, b.status))
                            .style(Style::default().fg(color))
                    })
                    .collect()
            })
            .unwrap_or_default();
        let batch_list = List::new(items).block(
            Block::default()
                .borders(Borders::ALL)
                .title("Batches")
                .border_style(Style::default().add_modifier(Modifier::BOLD)),
        );
        f.render_widget(batch_list, panes[0]);

        let summary = match &self.view {
            Some(v) => format!(
                "Targets:   {}\nChecked:   {}\nOnline:    {}\nOffline:   {}\n\nBatches:   {}\nActive:    {}\nCompleted: {}\nFailed:    {}\n\nCancelled: {}",
                v.total_proxies,
                v.total_checked,
                v.total_online,
                v.total_offline,
                v.total_batches,
                v.active_batches,
                v.completed_batches,
                v.failed_batches,
                if v.cancelled { "yes" } else { "no" },
            ),
            None => "Waiting for first progress poll...".to_string(),
        };
        let summary = Paragraph::new(summary)
            .wrap(Wrap { trim: false })
            .block(Block::default().borders(Borders::ALL).title("Session"));
        f.render_widget(summary, panes[1]);

        // Status bar
        let status = Paragraph::new(self.status_message.clone())
            .style(if self.is_finished {
                Style::default().fg(Color::Green)
            } else {
                Style::default().fg(Color::Yellow)
            })
            .wrap(Wrap { trim: true })
            .block(Block::default().borders(Borders::ALL).title("Status"));
        f.render_widget(status, chunks[3]);
    }
}
