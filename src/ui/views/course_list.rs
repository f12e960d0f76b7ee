use crossterm::event::{KeyCode, KeyEvent};
use draftsync::courses::{Course, CourseService};
use draftsync::query::{Query, QueryState};
use ratatui::layout::Position;
use ratatui::prelude::*;
use ratatui::widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph};
use tracing::debug;

use crate::ui::components::{InputResult, TextInput};
use crate::ui::ensure_valid_selection;
use crate::ui::renderfns::truncate;
use crate::ui::view::{ShortcutInfo, View, ViewAction};
use crate::ui::views::DraftEditorView;

struct Rename {
  course_id: String,
  input: TextInput,
}

/// Course list with optimistic delete and rename
pub struct CourseListView {
  service: CourseService,
  query: Query<Vec<Course>>,
  list_state: ListState,
  rename: Option<Rename>,
}

impl CourseListView {
  pub fn new(service: CourseService) -> Self {
    let mut query = service.list_query();
    query.fetch();

    Self {
      service,
      query,
      list_state: ListState::default(),
      rename: None,
    }
  }

  fn courses(&self) -> &[Course] {
    self.query.data().map(|v| v.as_slice()).unwrap_or(&[])
  }

  fn selected(&self) -> Option<&Course> {
    self.list_state.selected().and_then(|i| self.courses().get(i))
  }

  fn delete_selected(&self) {
    let Some(course) = self.selected() else {
      return;
    };
    let service = self.service.clone();
    let course_id = course.id.clone();
    tokio::spawn(async move {
      if let Err(e) = service.delete(&course_id).await {
        debug!(course_id = %course_id, "delete failed: {}", e);
      }
    });
  }

  fn submit_rename(&self, course_id: String, title: String) {
    let service = self.service.clone();
    tokio::spawn(async move {
      if let Err(e) = service.rename(&course_id, &title).await {
        debug!(course_id = %course_id, "rename failed: {}", e);
      }
    });
  }

  fn remote_edit_selected(&self) {
    let Some(course) = self.selected() else {
      return;
    };
    let notifier = self.service.notifier();
    match self.service.simulate_remote_edit(&course.id) {
      Ok(edited) => notifier.success(
        &format!("{} was edited elsewhere (now v{})", edited.title, edited.version),
        &format!("remote-edit-{}", edited.id),
      ),
      Err(e) => notifier.error(&e.user_message(), "remote-edit-error"),
    }
  }

  fn render_list(&mut self, frame: &mut Frame, area: Rect) {
    let len = self.courses().len();
    ensure_valid_selection(&mut self.list_state, len);

    let busy =
      self.service.delete_mutation().is_pending() || self.service.rename_mutation().is_pending();
    let title = match self.query.state() {
      QueryState::Idle | QueryState::Loading => " Courses (loading...) ".to_string(),
      QueryState::Error(e) => format!(" Courses (error: {}) ", truncate(e, 40)),
      QueryState::Success(courses) => {
        let mut title = format!(" Courses ({})", courses.len());
        if self.query.is_fetching() {
          title.push_str(" refreshing");
        }
        if busy {
          title.push_str(" saving");
        }
        title.push(' ');
        title
      }
    };

    let block = Block::default()
      .title(title)
      .title_alignment(Alignment::Center)
      .borders(Borders::ALL)
      .border_style(Style::default().fg(Color::Blue));

    if self.courses().is_empty() && !self.query.is_loading() {
      let content = if self.query.is_error() {
        "Failed to load courses. Press 'g' to retry."
      } else {
        "No courses."
      };
      let paragraph = Paragraph::new(content)
        .block(block)
        .style(Style::default().fg(Color::DarkGray));
      frame.render_widget(paragraph, area);
      return;
    }

    let width = area.width.saturating_sub(20) as usize;
    let items: Vec<ListItem> = self
      .courses()
      .iter()
      .map(|course| {
        let line = Line::from(vec![
          Span::styled(format!("{:<6}", course.id), Style::default().fg(Color::Cyan)),
          Span::styled(
            format!("v{:<4}", course.version),
            Style::default().fg(Color::Yellow),
          ),
          Span::raw(truncate(&course.title, width)),
        ]);
        ListItem::new(line)
      })
      .collect();

    let list = List::new(items)
      .block(block)
      .highlight_style(
        Style::default()
          .bg(Color::DarkGray)
          .add_modifier(Modifier::BOLD),
      )
      .highlight_symbol("> ");

    frame.render_stateful_widget(list, area, &mut self.list_state);
  }

  fn render_rename(&self, frame: &mut Frame, area: Rect) {
    let Some(rename) = &self.rename else {
      return;
    };
    let rect = Rect {
      x: area.x + 2,
      y: area.y + area.height.saturating_sub(4),
      width: area.width.saturating_sub(4),
      height: 3.min(area.height),
    };
    let block = Block::default()
      .title(format!(" Rename {} ", rename.course_id))
      .borders(Borders::ALL)
      .border_style(Style::default().fg(Color::Yellow));
    frame.render_widget(Clear, rect);
    frame.render_widget(Paragraph::new(rename.input.value()).block(block), rect);

    let cursor_x = rect.x + 1 + rename.input.cursor_position() as u16;
    if cursor_x < rect.x + rect.width.saturating_sub(1) {
      frame.set_cursor_position(Position::new(cursor_x, rect.y + 1));
    }
  }

  // Key handling helpers for or_else chain pattern
  fn handle_rename(&mut self, key: KeyEvent) -> Option<ViewAction> {
    let rename = self.rename.as_mut()?;
    match rename.input.handle_key(key) {
      InputResult::Submitted(title) => {
        let course_id = rename.course_id.clone();
        self.rename = None;
        self.submit_rename(course_id, title);
      }
      InputResult::Cancelled => self.rename = None,
      _ => {}
    }
    Some(ViewAction::None)
  }

  fn handle_navigation(&mut self, key: KeyEvent) -> Option<ViewAction> {
    match key.code {
      KeyCode::Char('j') | KeyCode::Down => {
        self.list_state.select_next();
        Some(ViewAction::None)
      }
      KeyCode::Char('k') | KeyCode::Up => {
        self.list_state.select_previous();
        Some(ViewAction::None)
      }
      _ => None,
    }
  }

  fn handle_actions(&mut self, key: KeyEvent) -> Option<ViewAction> {
    match key.code {
      KeyCode::Char('g') => {
        self.query.refetch();
        Some(ViewAction::None)
      }
      KeyCode::Char('d') => {
        self.delete_selected();
        Some(ViewAction::None)
      }
      KeyCode::Char('r') => {
        self.rename = self.selected().map(|course| Rename {
          course_id: course.id.clone(),
          input: TextInput::with_value(course.title.clone()),
        });
        Some(ViewAction::None)
      }
      KeyCode::Char('x') => {
        self.remote_edit_selected();
        Some(ViewAction::None)
      }
      KeyCode::Enter | KeyCode::Char('e') => {
        let course = self.selected()?.clone();
        Some(ViewAction::Push(Box::new(DraftEditorView::new(
          self.service.clone(),
          &course,
        ))))
      }
      KeyCode::Char('q') | KeyCode::Esc => Some(ViewAction::Pop),
      _ => None,
    }
  }
}

impl View for CourseListView {
  fn handle_key(&mut self, key: KeyEvent) -> ViewAction {
    self
      .handle_rename(key)
      .or_else(|| self.handle_navigation(key))
      .or_else(|| self.handle_actions(key))
      .unwrap_or(ViewAction::None)
  }

  fn render(&mut self, frame: &mut Frame, area: Rect) {
    self.render_list(frame, area);
    self.render_rename(frame, area);
  }

  fn breadcrumb_label(&self) -> String {
    "Courses".to_string()
  }

  fn tick(&mut self) {
    self.query.poll();
  }

  fn shortcuts(&self) -> Vec<ShortcutInfo> {
    let mut shortcuts = vec![
      ShortcutInfo::new("e", "edit").with_priority(10),
      ShortcutInfo::new("r", "rename").with_priority(20),
      ShortcutInfo::new("d", "delete").with_priority(30),
      ShortcutInfo::new("g", "refresh").with_priority(40),
      ShortcutInfo::new("q", "quit").with_priority(90),
    ];
    if self.service.api().is_simulated() {
      shortcuts.push(ShortcutInfo::new("x", "remote edit").with_priority(50));
    }
    shortcuts
  }
}
