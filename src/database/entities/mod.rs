pub mod sources;
pub mod languages;
pub mod places;
pub mod words;
