pub mod answers;
pub mod events;
pub mod literal;
pub mod normalize;
pub mod prompt;
