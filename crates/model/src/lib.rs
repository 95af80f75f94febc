pub mod block;
pub mod config;
pub mod gpt;
mod init;
pub mod language_model;
pub mod multiple_choice;
pub mod wrappers;

pub use block::TransformerBlock;
pub use config::{ActivationCheckpointing, ModelConfig};
pub use gpt::{build_block_mask, GptModel};
pub use language_model::{Encoder, LanguageModel, ModelOutput, NamedParameter};
pub use multiple_choice::MultipleChoice;
pub use wrappers::HalfPrecision;
