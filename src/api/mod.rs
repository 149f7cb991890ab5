pub mod ask;
pub mod dry_explain;
pub mod health;
pub mod normalize;
pub mod replay;
pub mod stream;
