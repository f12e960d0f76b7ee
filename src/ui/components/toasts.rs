use draftsync::notify::{Level, Notification};
use ratatui::prelude::*;
use ratatui::widgets::{Block, Borders, Clear, Paragraph, Wrap};

use crate::ui::renderfns::{level_color, truncate};

const TOAST_WIDTH: u16 = 48;

/// Stack visible notifications in the bottom-right corner of `area`,
/// newest at the bottom.
pub fn render_toasts(frame: &mut Frame, area: Rect, notifications: &[Notification]) {
  let width = TOAST_WIDTH.min(area.width);
  let mut bottom = area.y + area.height;

  for notification in notifications.iter().rev() {
    let height = 3;
    if bottom < area.y + height {
      break;
    }
    bottom -= height;
    let rect = Rect {
      x: area.x + area.width - width,
      y: bottom,
      width,
      height,
    };

    let color = level_color(notification.level);
    let title = match notification.level {
      Level::Success => " ok ",
      Level::Error => " error ",
      Level::Persistent => " action needed ",
    };
    let mut text = truncate(&notification.message, width.saturating_sub(4) as usize);
    if notification.replaced > 0 {
      text.push_str(&format!(" (x{})", notification.replaced + 1));
    }

    let paragraph = Paragraph::new(text)
      .wrap(Wrap { trim: true })
      .block(
        Block::default()
          .title(title)
          .borders(Borders::ALL)
          .border_style(Style::default().fg(color)),
      );
    frame.render_widget(Clear, rect);
    frame.render_widget(paragraph, rect);
  }
}
