//! Content translation between Matrix and Max.

mod from_matrix;
mod from_max;

pub use from_matrix::{MaxOutgoing, html_to_text, matrix_to_max};
pub use from_max::{MatrixOutgoing, max_to_matrix};
