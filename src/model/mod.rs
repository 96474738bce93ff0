//! Data model: directory and mailbox contacts, accounts, domains.

pub mod account;
pub mod contact;
pub mod domain;
pub mod gal;
