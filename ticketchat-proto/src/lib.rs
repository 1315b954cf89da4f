//! Shared protocol definitions for the `TicketChat` client and hub.

pub mod api;
pub mod hub;
pub mod message;
