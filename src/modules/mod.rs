//! Module implementations: built-in `text` and `scrape`, remote `http`.

pub mod http;
pub mod scrape;
pub mod text;
