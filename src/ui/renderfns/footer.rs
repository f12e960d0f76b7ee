use ratatui::prelude::*;
use ratatui::widgets::Paragraph;

/// Draw the footer bar: view breadcrumb on the left, cache summary on the right
pub fn draw_footer(frame: &mut Frame, area: Rect, breadcrumb: &[String], cached_entries: usize) {
  let left = Paragraph::new(Line::from(breadcrumb_spans(breadcrumb)));
  let right = Paragraph::new(format!("{} cached ", cached_entries))
    .style(Style::default().fg(Color::DarkGray))
    .alignment(Alignment::Right);

  frame.render_widget(
    Paragraph::new("").style(Style::default().bg(Color::Black)),
    area,
  );
  frame.render_widget(left, area);
  frame.render_widget(right, area);
}

fn breadcrumb_spans(breadcrumb: &[String]) -> Vec<Span<'static>> {
  let mut spans = vec![Span::raw(" ")];

  for (i, part) in breadcrumb.iter().enumerate() {
    if i > 0 {
      spans.push(Span::styled(" > ", Style::default().fg(Color::DarkGray)));
    }

    let style = if i == breadcrumb.len() - 1 {
      // Current view - highlighted
      Style::default().fg(Color::Cyan).bold()
    } else {
      Style::default().fg(Color::White)
    };

    spans.push(Span::styled(part.clone(), style));
  }
  spans
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_breadcrumb_joins_views() {
    let crumbs = vec!["Courses".to_string(), "Edit c1".to_string()];
    let text: String = breadcrumb_spans(&crumbs)
      .iter()
      .map(|s| s.content.as_ref())
      .collect();
    assert_eq!(text, " Courses > Edit c1");
  }
}
