pub mod ancestors;
pub mod completions;
pub mod create;
pub mod deactivate;
pub mod delta;
pub mod init;
pub mod leaderboard;
pub mod move_cmd;
pub mod propagation;
pub mod reconcile;
pub mod transfer;
pub mod tree;
pub mod verify;
