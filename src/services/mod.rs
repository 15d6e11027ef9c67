pub mod access;
pub mod content_store;
pub mod hasher;
pub mod ledger;
pub mod lookup;
pub mod storage_service;
