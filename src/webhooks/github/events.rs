use serde::Deserialize;

mod ping;
mod push;

pub use ping::*;
pub use push::*;

#[derive(Debug, Deserialize)]
pub struct Repository {
    pub full_name: String,
}
