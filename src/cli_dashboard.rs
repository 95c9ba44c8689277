//! Servers (farm members and their liveness)
//! Task Log (latest replicated tasks)
//! Status History (transitions observed by the health monitors)

use std::{
  io,
  sync::Arc,
  thread,
  time::{Duration, Instant},
};

use chrono::Utc;
use crossterm::{
  event::{self, DisableMouseCapture, EnableMouseCapture, Event as CEvent, KeyCode},
  execute,
  terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use farmsync::{
  config::Config,
  database::setup_database,
  error::StoreResult,
  models::{ServerStatus, StatusHistoryEntry, TaskLogEntry},
  server_registry::compute_status,
  store::{FLAG_FARM_ENABLED, FarmStore, PgStore},
};
use tokio::runtime::Runtime;
use tui::{
  Terminal,
  backend::{Backend, CrosstermBackend},
  layout::{Constraint, Direction, Layout, Rect},
  style::{Color, Modifier, Style},
  text::{Span, Spans},
  widgets::{Block, Borders, List, ListItem, Paragraph, Tabs},
};

const LOG_ROWS: i64 = 20;
const HISTORY_ROWS: usize = 30;

struct ServerInfo {
  id: i64,
  name: String,
  enabled: bool,
  status: ServerStatus,
  last_ping: String,
  checkpoint: String,
}

#[derive(Clone, Copy)]
enum DashboardTab {
  Servers,
  TaskLog,
  History,
}

struct App {
  current_tab: DashboardTab,
  farm_enabled: bool,
  high_water_mark: i64,
  servers: Vec<ServerInfo>,
  tasks: Vec<TaskLogEntry>,
  history: Vec<StatusHistoryEntry>,
  error: Option<String>,
}

impl App {
  fn new() -> Self {
    Self {
      current_tab: DashboardTab::Servers,
      farm_enabled: true,
      high_water_mark: 0,
      servers: vec![],
      tasks: vec![],
      history: vec![],
      error: None,
    }
  }

  fn next_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Servers => DashboardTab::TaskLog,
      DashboardTab::TaskLog => DashboardTab::History,
      DashboardTab::History => DashboardTab::Servers,
    }
  }

  fn previous_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Servers => DashboardTab::History,
      DashboardTab::TaskLog => DashboardTab::Servers,
      DashboardTab::History => DashboardTab::TaskLog,
    }
  }
}

async fn fetch_farm_state(store: &dyn FarmStore, offline_timeout: chrono::Duration) -> StoreResult<App> {
  let mut app = App::new();
  let now = Utc::now();

  app.farm_enabled = store.get_flag(FLAG_FARM_ENABLED).await?.unwrap_or(true);
  app.servers = store
    .list_servers(true)
    .await?
    .into_iter()
    .map(|server| ServerInfo {
      status: compute_status(&server, now, offline_timeout),
      last_ping: server
        .last_ping_time
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "N/A".into()),
      checkpoint: server
        .last_processed_sequence
        .map(|s| s.to_string())
        .unwrap_or_else(|| "-".into()),
      id: server.id,
      name: server.name,
      enabled: server.enabled,
    })
    .collect();

  app.high_water_mark = store.max_sequence().await?;
  let after = (app.high_water_mark - LOG_ROWS).max(0);
  let mut tasks = store.read_entries_since(after, LOG_ROWS as usize).await?;
  tasks.reverse();
  app.tasks = tasks;

  app.history = store.list_status_history(HISTORY_ROWS).await?;
  Ok(app)
}

fn main() -> anyhow::Result<()> {
  let config = Config::from_env()?;
  let rt = Runtime::new()?;
  let pool = rt.block_on(setup_database(&config.database_url))?;
  let store: Arc<dyn FarmStore> = Arc::new(PgStore::new(pool));
  let offline_timeout = config.sync.offline_timeout;

  let (tx, rx) = std::sync::mpsc::channel::<App>();

  {
    let store = store.clone();
    thread::spawn(move || {
      loop {
        let app_state = rt.block_on(fetch_farm_state(store.as_ref(), offline_timeout)).unwrap_or_else(|e| {
          let mut app = App::new();
          app.error = Some(e.to_string());
          app
        });
        if tx.send(app_state).is_err() {
          break;
        }
        thread::sleep(Duration::from_secs(2));
      }
    });
  }

  enable_raw_mode()?;
  let mut stdout = io::stdout();
  execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
  let backend = CrosstermBackend::new(stdout);
  let mut terminal = Terminal::new(backend)?;

  let mut app = App::new();
  let tick_rate = Duration::from_millis(500);
  let mut last_tick = Instant::now();

  loop {
    if let Ok(new_state) = rx.try_recv() {
      let tab = app.current_tab;
      app = new_state;
      app.current_tab = tab;
    }
    terminal.draw(|f| ui(f, &app))?;

    let timeout = tick_rate
      .checked_sub(last_tick.elapsed())
      .unwrap_or_else(|| Duration::from_secs(0));
    if event::poll(timeout)? {
      if let CEvent::Key(key) = event::read()? {
        match key.code {
          KeyCode::Char('q') => break,
          KeyCode::Right => app.next_tab(),
          KeyCode::Left => app.previous_tab(),
          _ => {}
        }
      }
    }
    if last_tick.elapsed() >= tick_rate {
      last_tick = Instant::now();
    }
  }

  disable_raw_mode()?;
  execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
  terminal.show_cursor()?;
  Ok(())
}

fn status_color(status: ServerStatus) -> Color {
  match status {
    ServerStatus::Online => Color::Green,
    ServerStatus::Offline => Color::Red,
    ServerStatus::Unknown => Color::Gray,
  }
}

fn ui<B: Backend>(f: &mut tui::Frame<B>, app: &App) {
  let chunks = Layout::default()
    .direction(Direction::Vertical)
    .margin(1)
    .constraints([Constraint::Length(3), Constraint::Min(0), Constraint::Length(3)].as_ref())
    .split(f.size());

  let tab_titles = vec!["Servers", "Task Log", "Status History"];
  let tabs = Tabs::new(
    tab_titles
      .iter()
      .map(|t| Spans::from(Span::styled(*t, Style::default().fg(Color::Yellow))))
      .collect(),
  )
  .block(Block::default().borders(Borders::ALL).title("Farm Dashboard"))
  .highlight_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
  .select(match app.current_tab {
    DashboardTab::Servers => 0,
    DashboardTab::TaskLog => 1,
    DashboardTab::History => 2,
  });
  f.render_widget(tabs, chunks[0]);

  match app.current_tab {
    DashboardTab::Servers => render_servers(f, app, chunks[1]),
    DashboardTab::TaskLog => render_tasks(f, app, chunks[1]),
    DashboardTab::History => render_history(f, app, chunks[1]),
  }

  let footer_text = match &app.error {
    Some(e) => format!("Store error: {} | q: Quit", e),
    None => format!(
      "Sync: {} | ←/→: Switch Tabs | q: Quit",
      if app.farm_enabled { "enabled" } else { "DISABLED" }
    ),
  };
  let footer = Paragraph::new(footer_text)
    .style(Style::default().fg(if app.error.is_some() { Color::Red } else { Color::White }))
    .block(Block::default().borders(Borders::ALL));
  f.render_widget(footer, chunks[2]);
}

fn render_servers<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let items: Vec<ListItem> = app
    .servers
    .iter()
    .map(|s| {
      let mut name_style = Style::default().add_modifier(Modifier::BOLD);
      if !s.enabled {
        name_style = name_style.fg(Color::DarkGray);
      }
      let lines = vec![
        Spans::from(vec![
          Span::styled(format!("#{} {}", s.id, s.name), name_style),
          Span::raw(if s.enabled { "" } else { " (disabled)" }),
        ]),
        Spans::from(vec![
          Span::raw("Status: "),
          Span::styled(s.status.as_str(), Style::default().fg(status_color(s.status))),
        ]),
        Spans::from(Span::raw(format!("Last ping: {} | Checkpoint: {}", s.last_ping, s.checkpoint))),
      ];
      ListItem::new(lines)
    })
    .collect();

  let list = List::new(items).block(Block::default().borders(Borders::ALL).title("Farm Servers"));
  f.render_widget(list, area);
}

fn render_tasks<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let items: Vec<ListItem> = app
    .tasks
    .iter()
    .map(|t| {
      ListItem::new(Spans::from(vec![
        Span::styled(
          format!("{:>8} ", t.sequence_id),
          Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
        ),
        Span::styled(t.created_at.format("%H:%M:%S ").to_string(), Style::default().fg(Color::Green)),
        Span::raw(format!(
          "{} | from #{} | to {} | params: {}",
          t.type_name,
          t.origin_server_id,
          t.target,
          t.text_parameters.join(", ")
        )),
      ]))
    })
    .collect();
  let header = format!("Latest Tasks (high-water mark: {})", app.high_water_mark);
  let list = List::new(items).block(Block::default().borders(Borders::ALL).title(header));
  f.render_widget(list, area);
}

fn render_history<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let items: Vec<ListItem> = app
    .history
    .iter()
    .map(|h| {
      ListItem::new(Spans::from(vec![
        Span::styled(
          h.change.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
          Style::default().fg(Color::Green),
        ),
        Span::raw(format!(" - observer #{} saw server #{} ", h.observer_id, h.change.server_id)),
        Span::styled(
          h.change.old_status.as_str(),
          Style::default().fg(status_color(h.change.old_status)),
        ),
        Span::raw(" -> "),
        Span::styled(
          h.change.new_status.as_str(),
          Style::default().fg(status_color(h.change.new_status)),
        ),
      ]))
    })
    .collect();
  let list = List::new(items).block(Block::default().borders(Borders::ALL).title("Status History"));
  f.render_widget(list, area);
}
