use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use draftsync::autosave::SaveStatus;
use draftsync::courses::{Course, CourseService, DraftSession};
use ratatui::layout::Position;
use ratatui::prelude::*;
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};
use tokio::sync::watch;
use tracing::debug;

use crate::ui::components::{InputResult, TextInput};
use crate::ui::renderfns::save_status_color;
use crate::ui::view::{ShortcutInfo, View, ViewAction};

/// Description editor backed by an autosave session
pub struct DraftEditorView {
  service: CourseService,
  session: DraftSession,
  title: String,
  input: TextInput,
  status: watch::Receiver<SaveStatus>,
  /// Replace the editor text with the session's once the conflict clears
  resync: bool,
}

impl DraftEditorView {
  pub fn new(service: CourseService, course: &Course) -> Self {
    let session = service.open_draft(course);
    let status = session.autosave().subscribe();
    Self {
      service,
      session,
      title: course.title.clone(),
      input: TextInput::with_value(course.description.clone()),
      status,
      resync: false,
    }
  }

  fn spawn_save(&self) {
    let session = self.session.clone();
    tokio::spawn(async move {
      if let Err(e) = session.save_now().await {
        debug!(course_id = session.course_id(), "forced save failed: {}", e);
      }
    });
  }

  fn spawn_keep_local(&self) {
    let session = self.session.clone();
    tokio::spawn(async move {
      if let Err(e) = session.keep_local().await {
        debug!(course_id = session.course_id(), "keep local failed: {}", e);
      }
    });
  }

  fn spawn_accept_remote(&mut self) {
    self.resync = true;
    let session = self.session.clone();
    tokio::spawn(async move {
      if let Err(e) = session.accept_remote().await {
        debug!(course_id = session.course_id(), "accept remote failed: {}", e);
      }
    });
  }

  fn remote_edit(&self) {
    let notifier = self.service.notifier();
    match self.service.simulate_remote_edit(self.session.course_id()) {
      Ok(edited) => notifier.success(
        &format!("Edited elsewhere (now v{})", edited.version),
        &format!("remote-edit-{}", edited.id),
      ),
      Err(e) => notifier.error(&e.user_message(), "remote-edit-error"),
    }
  }

  fn handle_chord(&mut self, key: KeyEvent) -> Option<ViewAction> {
    if !key.modifiers.contains(KeyModifiers::CONTROL) {
      return None;
    }
    match key.code {
      KeyCode::Char('s') => self.spawn_save(),
      KeyCode::Char('l') if self.session.status() == SaveStatus::Conflict => self.spawn_keep_local(),
      KeyCode::Char('r') if self.session.status() == SaveStatus::Conflict => {
        self.spawn_accept_remote()
      }
      KeyCode::Char('x') => self.remote_edit(),
      _ => return None,
    }
    Some(ViewAction::None)
  }

  fn handle_input(&mut self, key: KeyEvent) -> ViewAction {
    match self.input.handle_key(key) {
      InputResult::Edited => {
        self.session.edit(self.input.value());
        ViewAction::None
      }
      InputResult::Submitted(_) => {
        self.spawn_save();
        ViewAction::None
      }
      InputResult::Cancelled => ViewAction::Pop,
      InputResult::Consumed | InputResult::NotHandled => ViewAction::None,
    }
  }

  fn status_line(&self, status: SaveStatus) -> Line<'static> {
    let mut spans = vec![
      Span::styled(
        format!(" {} ", status.label()),
        Style::default()
          .fg(Color::Black)
          .bg(save_status_color(status)),
      ),
      Span::styled(
        format!("  based on v{}", self.session.base_version()),
        Style::default().fg(Color::DarkGray),
      ),
    ];
    if self.session.autosave().has_unsaved_changes() && status != SaveStatus::Saving {
      spans.push(Span::styled("  unsaved", Style::default().fg(Color::Yellow)));
    }
    match status {
      SaveStatus::Conflict => spans.push(Span::styled(
        "  Ctrl-L keep mine  Ctrl-R take theirs",
        Style::default().fg(Color::Magenta),
      )),
      SaveStatus::Error => {
        if let Some(error) = self.session.autosave().last_error() {
          spans.push(Span::styled(
            format!("  {}", error.user_message()),
            Style::default().fg(Color::Red),
          ));
        }
      }
      _ => {}
    }
    Line::from(spans)
  }
}

impl View for DraftEditorView {
  fn handle_key(&mut self, key: KeyEvent) -> ViewAction {
    match self.handle_chord(key) {
      Some(action) => action,
      None => self.handle_input(key),
    }
  }

  fn render(&mut self, frame: &mut Frame, area: Rect) {
    let chunks = Layout::default()
      .direction(Direction::Vertical)
      .constraints([Constraint::Min(3), Constraint::Length(1)])
      .split(area);

    let block = Block::default()
      .title(format!(" {} ", self.title))
      .title_alignment(Alignment::Center)
      .borders(Borders::ALL)
      .border_style(Style::default().fg(Color::Blue));
    let inner = block.inner(chunks[0]);
    let text = Paragraph::new(self.input.value().to_string())
      .wrap(Wrap { trim: false })
      .block(block);
    frame.render_widget(text, chunks[0]);

    if inner.width > 0 {
      let cursor = self.input.cursor_position() as u16;
      let (row, col) = (cursor / inner.width, cursor % inner.width);
      if row < inner.height {
        frame.set_cursor_position(Position::new(inner.x + col, inner.y + row));
      }
    }

    let status = *self.status.borrow();
    frame.render_widget(Paragraph::new(self.status_line(status)), chunks[1]);
  }

  fn breadcrumb_label(&self) -> String {
    format!("Edit {}", self.session.course_id())
  }

  fn tick(&mut self) {
    let status = *self.status.borrow_and_update();
    if self.resync && status != SaveStatus::Conflict {
      self.input.set_value(self.session.description());
      self.resync = false;
    }
  }

  /// Flush pending text when leaving the editor.
  fn close(&mut self) {
    let autosave = self.session.autosave();
    if autosave.has_unsaved_changes() && autosave.status() != SaveStatus::Conflict {
      self.spawn_save();
    }
  }

  fn shortcuts(&self) -> Vec<ShortcutInfo> {
    let mut shortcuts = vec![
      ShortcutInfo::new("Ctrl-S", "save").with_priority(10),
      ShortcutInfo::new("Esc", "back").with_priority(90),
    ];
    if self.session.status() == SaveStatus::Conflict {
      shortcuts.push(ShortcutInfo::new("Ctrl-L", "keep mine").with_priority(20));
      shortcuts.push(ShortcutInfo::new("Ctrl-R", "take theirs").with_priority(30));
    }
    if self.service.api().is_simulated() {
      shortcuts.push(ShortcutInfo::new("Ctrl-X", "remote edit").with_priority(50));
    }
    shortcuts
  }
}
