//! `loupe-caption` service: CLIP tokenizer and feature-file adapters, the
//! caption request service, and the interactive JSON-line protocol.

pub mod protocol;
pub mod service;
pub mod tokenizer;
pub mod vision;
