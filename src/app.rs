use color_eyre::{eyre::eyre, Result};
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use crossterm::terminal::{
  disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use draftsync::cache::CacheStore;
use draftsync::config::Config;
use draftsync::courses::{CourseApi, CourseService, SimulatedBackend};
use draftsync::notify::NotificationCenter;
use draftsync::transport::HttpClient;
use ratatui::prelude::*;
use std::io::stdout;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use crate::event::{Event, EventHandler};
use crate::ui;
use crate::ui::view::{View, ViewAction};
use crate::ui::views::CourseListView;

const GC_INTERVAL: Duration = Duration::from_secs(30);

/// Main application state
pub struct App {
  /// Navigation stack - root is always at index 0
  view_stack: Vec<Box<dyn View>>,

  store: CacheStore,

  notifications: NotificationCenter,

  /// Backend label for the header
  backend: String,

  gc: JoinHandle<()>,

  should_quit: bool,
}

impl App {
  pub fn new(config: &Config) -> Result<Self> {
    let api = match &config.api.base_url {
      Some(url) => {
        let client = HttpClient::new(url, Config::api_token(), config.api.timeout())
          .map_err(|e| eyre!("Failed to create API client: {}", e))?;
        CourseApi::Http(client)
      }
      None => CourseApi::Simulated(SimulatedBackend::new(
        Duration::from_millis(config.demo.latency_ms),
        config.demo.fail_every,
      )),
    };
    let backend = api.label();
    info!(backend = %backend, "starting");

    let store = CacheStore::new((&config.cache).into());
    let gc = store.spawn_gc(GC_INTERVAL);
    let notifications = NotificationCenter::new(config.notifications.display_window());

    let service = CourseService::new(
      api,
      store.clone(),
      Arc::new(notifications.clone()),
      (&config.retry).into(),
      (&config.autosave).into(),
    );

    Ok(Self {
      view_stack: vec![Box::new(CourseListView::new(service))],
      store,
      notifications,
      backend,
      gc,
      should_quit: false,
    })
  }

  pub async fn run(&mut self) -> Result<()> {
    // Setup terminal
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;

    let mut events = EventHandler::new(Duration::from_millis(100));

    let result = async {
      while !self.should_quit {
        terminal.draw(|frame| ui::draw(frame, self))?;

        match events.next().await {
          Some(event) => self.handle_event(event),
          None => break,
        }
      }
      Ok::<_, color_eyre::Report>(())
    }
    .await;

    // Cleanup terminal, also after a draw error
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    result
  }

  pub fn current_view(&self) -> Option<&dyn View> {
    self.view_stack.last().map(|v| v.as_ref())
  }

  pub fn current_view_mut(&mut self) -> Option<&mut Box<dyn View>> {
    self.view_stack.last_mut()
  }

  pub fn breadcrumbs(&self) -> Vec<String> {
    self.view_stack.iter().map(|v| v.breadcrumb_label()).collect()
  }

  pub fn backend(&self) -> &str {
    &self.backend
  }

  pub fn notifications(&self) -> &NotificationCenter {
    &self.notifications
  }

  pub fn cached_entries(&self) -> usize {
    self.store.len()
  }

  fn handle_event(&mut self, event: Event) {
    match event {
      Event::Key(key) => self.handle_key(key),
      Event::Tick => {
        if let Some(view) = self.view_stack.last_mut() {
          view.tick();
        }
        self.notifications.prune();
      }
      Event::Resize => {} // Redrawn on the next loop iteration
    }
  }

  fn handle_key(&mut self, key: KeyEvent) {
    if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
      self.should_quit = true;
      return;
    }

    let Some(view) = self.view_stack.last_mut() else {
      self.should_quit = true;
      return;
    };
    match view.handle_key(key) {
      ViewAction::None => {}
      ViewAction::Push(view) => self.view_stack.push(view),
      ViewAction::Pop => self.pop_view(),
    }
  }

  fn pop_view(&mut self) {
    if self.view_stack.len() > 1 {
      if let Some(mut view) = self.view_stack.pop() {
        view.close();
      }
      // Show what changed while the child view was open
      if let Some(parent) = self.view_stack.last_mut() {
        parent.tick();
      }
    } else {
      self.should_quit = true;
    }
  }
}

impl Drop for App {
  fn drop(&mut self) {
    self.gc.abort();
  }
}
