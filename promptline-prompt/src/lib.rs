mod expr;
mod template;

pub use expr::{display_value, evaluate, ExprError};
pub use template::PromptTemplate;
