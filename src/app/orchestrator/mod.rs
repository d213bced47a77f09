pub mod execute;
pub mod pipeline;
pub mod router;

#[cfg(test)]
mod tests;
