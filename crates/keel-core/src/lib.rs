pub mod compress;
pub mod config;
pub mod index;
pub mod maintenance;
pub mod platform;
pub mod repo;

#[cfg(test)]
mod tests;
#[cfg(test)]
mod testutil;
