pub mod dynamodb;
pub mod invoke;
