mod course_list;
mod draft_editor;

pub use course_list::CourseListView;
pub use draft_editor::DraftEditorView;
