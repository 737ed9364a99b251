pub mod bracket;
pub mod db;
pub mod engine;
pub mod entry;
pub mod matchup;
pub mod membership;
pub mod seed;
pub mod settings;
pub mod vote;
