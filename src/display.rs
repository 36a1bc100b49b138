//! Terminal rendering of the grouped transcript
//!
//! Thin presentation wrapper over the reconciler's projection; provisional
//! blocks are marked since the server may still revise them.

use crate::session::Snapshot;

/// Print the current snapshot
pub(crate) fn render(snapshot: &Snapshot) {
    println!();
    match &snapshot.language {
        Some(language) => println!("== {} ({}) ==", snapshot.state, language),
        None => println!("== {} ==", snapshot.state),
    }

    if snapshot.blocks.is_empty() {
        println!("(no transcript yet)");
        return;
    }

    for block in &snapshot.blocks {
        let marker = if block.provisional { "~" } else { " " };
        println!(
            "{}[{}] {}: {}",
            marker,
            block.start_time.format("%H:%M:%S"),
            block.speaker,
            block.text
        );
    }
}
