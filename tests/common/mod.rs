pub(crate) mod logging;

pub(crate) mod mem_db;

pub(crate) mod mem_store;

pub(crate) mod network;

pub(crate) mod node;
