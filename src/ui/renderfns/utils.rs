use draftsync::autosave::SaveStatus;
use draftsync::notify::Level;
use ratatui::prelude::Color;

/// Truncate a string to a maximum number of characters, adding "..." if truncated
pub fn truncate(s: &str, max_len: usize) -> String {
  if s.chars().count() <= max_len {
    s.to_string()
  } else {
    let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
    format!("{}...", kept)
  }
}

/// Display color for an autosave status
pub fn save_status_color(status: SaveStatus) -> Color {
  match status {
    SaveStatus::Idle => Color::DarkGray,
    SaveStatus::Saving => Color::Yellow,
    SaveStatus::Saved => Color::Green,
    SaveStatus::Error => Color::Red,
    SaveStatus::Conflict => Color::Magenta,
  }
}

/// Border color for a notification
pub fn level_color(level: Level) -> Color {
  match level {
    Level::Success => Color::Green,
    Level::Error => Color::Red,
    Level::Persistent => Color::Magenta,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_truncate_short_string() {
    assert_eq!(truncate("hello", 10), "hello");
  }

  #[test]
  fn test_truncate_exact_length() {
    assert_eq!(truncate("hello", 5), "hello");
  }

  #[test]
  fn test_truncate_long_string() {
    assert_eq!(truncate("hello world", 8), "hello...");
  }

  #[test]
  fn test_truncate_counts_characters() {
    assert_eq!(truncate("ééééé", 5), "ééééé");
    assert_eq!(truncate("éééééé", 5), "éé...");
  }

  #[test]
  fn test_save_status_colors() {
    assert_eq!(save_status_color(SaveStatus::Saved), Color::Green);
    assert_eq!(save_status_color(SaveStatus::Conflict), Color::Magenta);
    assert_eq!(save_status_color(SaveStatus::Error), Color::Red);
  }

  #[test]
  fn test_persistent_notifications_stand_out() {
    assert_ne!(level_color(Level::Persistent), level_color(Level::Error));
  }
}
