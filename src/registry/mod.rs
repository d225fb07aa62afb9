//! Topic registry: configured topics, keyword groups, entity links, status rules.

pub mod links;
pub mod status;
pub mod topics;
