mod expr;
mod state;

pub(crate) use expr::*;
pub(crate) use state::*;
