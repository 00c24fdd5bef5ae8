pub mod logger;
pub mod vector;
