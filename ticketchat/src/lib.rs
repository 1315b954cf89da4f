//! `TicketChat`: live chat client for support tickets.

pub mod app;
pub mod backend;
pub mod chat;
pub mod config;
pub mod net;
pub mod transport;
