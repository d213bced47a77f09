pub mod executor;
pub mod logcat;
pub mod registry;
pub mod storage;

#[cfg(test)]
pub mod test_support;
