pub mod business;
pub mod chat;
pub mod config;
pub mod cookies;
pub mod crypto;
pub mod extract;
pub mod handler;
pub mod logging;
pub mod markov;
pub mod models;
pub mod router;
pub mod scraping;
