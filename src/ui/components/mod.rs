mod input;
mod toasts;

pub use input::{InputResult, TextInput};
pub use toasts::render_toasts;
