// Embedded runtime surface: the engine model and its one-shot bootstrap.
pub mod bootstrap;
pub mod engine;
