//! `TicketChat` hub library.
//!
//! A small ticketing backend for development and tests: a JSON hub over
//! WebSocket with one broadcast group per ticket, plus the history and
//! upload REST endpoints the chat client talks to.

pub mod api;
pub mod config;
pub mod hub;
pub mod store;
