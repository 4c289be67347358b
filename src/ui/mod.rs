pub mod icons;
pub mod output;
pub mod theme;

pub use icons::Icons;
pub use output::{header, info, section, status, success, summary_row, warn};
pub use theme::{theme, Theme};
