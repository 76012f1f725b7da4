//! Event sources feeding the pipeline: the state watcher (pane
//! membership), the terminal poller (raw snapshots), and the JSONL tailer
//! (structured streams).

pub mod poller;
pub mod state_watcher;
pub mod tailer;
