pub mod availability;
pub mod choker;
pub mod coordinator;
pub mod disk;
pub mod events;
pub mod metainfo;
pub mod peer;
pub mod peers;
pub mod picker;
pub mod rate;
pub mod timeout;
pub mod torrent;
pub mod tracker;
