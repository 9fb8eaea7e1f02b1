//! `queue` subcommand — execution-queue administration.

use tenex_queue::ExecutionQueue;
use tenex_store::ConversationStore;

use super::{load_config, QueueCommand};

pub async fn run(cmd: QueueCommand) -> anyhow::Result<()> {
    let (config, _config_path) = load_config()?;
    let store = ConversationStore::new(&config.store.path);
    store
        .load_all()
        .map_err(|e| anyhow::anyhow!("loading conversation state: {e}"))?;
    let queue = ExecutionQueue::new(
        &config.store.path,
        Some(config.queue.avg_exec_hint_ms),
        Some(config.lock.max_duration_ms),
    );
    let now = chrono::Utc::now();
    // Populate in-memory state from whatever is on disk — `known_projects`
    // only sees projects this process has touched otherwise. Same
    // recovery semantics as kernel boot: expired locks are released and
    // promoted, and a lock or queue entry whose conversation is gone
    // from the store is dropped too, never silently reported as still
    // held.
    queue
        .load_all(now, &store.known_ids())
        .map_err(|e| anyhow::anyhow!("loading queue state: {e}"))?;

    match cmd {
        QueueCommand::Status => {
            let mut projects = queue.known_projects();
            projects.sort();
            if projects.is_empty() {
                println!("no tracked projects");
                return Ok(());
            }
            for project_id in projects {
                let waiting = queue.queue_len(&project_id);
                match queue.current_holder(&project_id) {
                    Some(holder) => println!("{project_id}: held by {holder}, {waiting} waiting"),
                    None => println!("{project_id}: idle, {waiting} waiting"),
                }
            }
        }
        QueueCommand::ForceRelease { project_id, reason } => {
            queue.force_release(&project_id, &reason, now)?;
            println!("{project_id}: lock force-released ({reason})");
        }
        QueueCommand::Remove {
            project_id,
            conversation_id,
        } => {
            if queue.remove_from_queue(&project_id, &conversation_id) {
                println!("{project_id}: removed {conversation_id} from the wait queue");
            } else {
                println!("{project_id}: {conversation_id} was not in the wait queue");
                std::process::exit(1);
            }
        }
    }
    Ok(())
}
