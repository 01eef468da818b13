//! Block and contract event follower
//!
//! Polls the head block and walks parent hashes back to the last block it
//! knows, so blocks are published in chain order even after falling behind.
//! A new block whose parent is a known block other than the last one means
//! the chain reorganized. Every block after that common parent is published
//! as removed, and contract events already published from it are published
//! again with `removed` set.
//!
//! Contract events are held back until their block is `confirmation_blocks`
//! deep. Only logs from registered contracts are fetched and decoded.

use super::client::NodeClient;
use crate::config::EventsConfig;
use crate::contracts::{ContractRegistry, DecodedEvent};
use crate::error::{CoordinatorError, CoordinatorResult};

use ethers::types::{Block, Log, H256};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Block identity as seen by the follower
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRef {
    pub number: u64,
    pub hash: H256,
    pub parent_hash: H256,
}

impl BlockRef {
    fn from_block(block: &Block<H256>) -> CoordinatorResult<Self> {
        match (block.number, block.hash) {
            (Some(number), Some(hash)) => Ok(Self {
                number: number.as_u64(),
                hash,
                parent_hash: block.parent_hash,
            }),
            _ => Err(CoordinatorError::Rpc {
                method: "eth_getBlockByHash".to_string(),
                message: "block has no number or hash yet".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChainEvent {
    NewBlock {
        block: BlockRef,
    },
    BlockRemoved {
        block: BlockRef,
    },
    #[serde(rename_all = "camelCase")]
    ContractEvent {
        removed: bool,
        /// Raw log with `removed` set to match
        raw_event: Log,
        event: DecodedEvent,
    },
}

/// Published event with its position in the feed
#[derive(Debug, Clone, Serialize)]
pub struct FeedEntry {
    pub sequence: u64,
    #[serde(flatten)]
    pub event: ChainEvent,
}

struct FeedBuffer {
    next: u64,
    recent: VecDeque<FeedEntry>,
}

/// Fan-out of chain events: live subscribers plus a bounded replay buffer
pub struct EventFeed {
    sender: broadcast::Sender<FeedEntry>,
    buffer: Mutex<FeedBuffer>,
    capacity: usize,
}

impl EventFeed {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            buffer: Mutex::new(FeedBuffer {
                next: 1,
                recent: VecDeque::with_capacity(capacity),
            }),
            capacity,
        }
    }

    /// Append an event; returns its sequence number
    pub async fn publish(&self, event: ChainEvent) -> u64 {
        let mut buffer = self.buffer.lock().await;
        let entry = FeedEntry {
            sequence: buffer.next,
            event,
        };
        buffer.next += 1;

        if buffer.recent.len() == self.capacity {
            buffer.recent.pop_front();
        }
        buffer.recent.push_back(entry.clone());
        // No live subscribers is fine
        let _ = self.sender.send(entry.clone());
        entry.sequence
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedEntry> {
        self.sender.subscribe()
    }

    /// Buffered events with a sequence above `after`, oldest first
    pub async fn since(&self, after: u64, limit: usize) -> Vec<FeedEntry> {
        self.buffer
            .lock()
            .await
            .recent
            .iter()
            .filter(|e| e.sequence > after)
            .take(limit)
            .cloned()
            .collect()
    }
}

struct BlockLogs {
    block: BlockRef,
    logs: Vec<Log>,
}

#[derive(Default)]
struct FollowerState {
    /// Most recent canonical blocks, oldest first
    recent: VecDeque<BlockRef>,
    /// Logs waiting for confirmation depth
    pending: VecDeque<BlockLogs>,
    /// Logs already published, kept for retraction
    published: VecDeque<BlockLogs>,
}

impl FollowerState {
    fn knows(&self, hash: &H256) -> bool {
        self.recent.iter().any(|b| b.hash == *hash)
    }

    fn last_hash(&self) -> Option<H256> {
        self.recent.back().map(|b| b.hash)
    }
}

/// Follows the canonical chain and publishes blocks and contract events
pub struct BlockFollower {
    client: Arc<dyn NodeClient>,
    registry: Arc<ContractRegistry>,
    feed: Arc<EventFeed>,
    config: EventsConfig,
    state: Mutex<FollowerState>,
}

impl BlockFollower {
    pub fn new(
        client: Arc<dyn NodeClient>,
        registry: Arc<ContractRegistry>,
        feed: Arc<EventFeed>,
        config: EventsConfig,
    ) -> Self {
        Self {
            client,
            registry,
            feed,
            config,
            state: Mutex::new(FollowerState::default()),
        }
    }

    /// Poll forever at the configured interval
    pub async fn run(self: Arc<Self>) {
        info!(
            "Following blocks every {}ms ({} confirmation blocks)",
            self.config.poll_ms, self.config.confirmation_blocks
        );
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = self.poll_once().await {
                warn!(
                    "Block polling failed, retrying in {}ms: {}",
                    self.config.poll_ms, e
                );
            }
        }
    }

    /// One polling round; returns how many new blocks were processed
    pub async fn poll_once(&self) -> CoordinatorResult<usize> {
        let mut state = self.state.lock().await;

        let head = match self.client.latest_block().await? {
            Some(block) => BlockRef::from_block(&block)?,
            None => return Ok(0),
        };
        if state.last_hash() == Some(head.hash) {
            return Ok(0);
        }
        if state.recent.is_empty() {
            debug!("Starting from block {} ({:?})", head.number, head.hash);
            state.recent.push_back(head);
            return Ok(0);
        }

        // Walk back to a block we know, bounded when far behind
        let mut new_blocks = vec![head];
        loop {
            let parent = new_blocks[new_blocks.len() - 1].parent_hash;
            if state.knows(&parent) || new_blocks.len() >= self.config.max_catch_up {
                break;
            }
            debug!("Fetching block {:?}", parent);
            match self.client.block_by_hash(parent).await? {
                Some(block) => new_blocks.push(BlockRef::from_block(&block)?),
                None => {
                    warn!("Block {:?} is not available yet", parent);
                    return Ok(0);
                }
            }
        }

        let count = new_blocks.len();
        for block in new_blocks.into_iter().rev() {
            self.process_block(&mut state, block).await?;
        }
        Ok(count)
    }

    async fn process_block(&self, state: &mut FollowerState, block: BlockRef) -> CoordinatorResult<()> {
        let addresses = self.registry.addresses().await;
        let logs = if addresses.is_empty() {
            Vec::new()
        } else {
            self.client.block_logs(block.hash, addresses).await?
        };

        let parent_known = state.knows(&block.parent_hash);
        if state.last_hash() != Some(block.parent_hash) && parent_known {
            self.reorganize(state, block.parent_hash).await;
        }

        state.recent.push_back(block.clone());
        while state.recent.len() > self.config.history_blocks {
            state.recent.pop_front();
        }
        debug!("New block {} ({:?})", block.number, block.hash);
        self.feed
            .publish(ChainEvent::NewBlock {
                block: block.clone(),
            })
            .await;

        let head = block.number;
        state.pending.push_back(BlockLogs { block, logs });
        self.release_confirmed(state, head).await;
        Ok(())
    }

    /// Drop every block above `common_parent`
    async fn reorganize(&self, state: &mut FollowerState, common_parent: H256) {
        while let Some(top) = state.recent.back() {
            if top.hash == common_parent {
                break;
            }
            let Some(removed) = state.recent.pop_back() else {
                break;
            };

            warn!(
                "Block {} ({:?}) left the canonical chain",
                removed.number, removed.hash
            );
            state.pending.retain(|b| b.block.hash != removed.hash);
            if let Some(pos) = state.published.iter().position(|b| b.block.hash == removed.hash) {
                if let Some(entry) = state.published.remove(pos) {
                    self.publish_logs(&entry, true).await;
                }
            }
            self.feed
                .publish(ChainEvent::BlockRemoved { block: removed })
                .await;
        }
    }

    async fn release_confirmed(&self, state: &mut FollowerState, head: u64) {
        while let Some(front) = state.pending.front() {
            if head.saturating_sub(front.block.number) < self.config.confirmation_blocks {
                break;
            }
            let Some(entry) = state.pending.pop_front() else {
                break;
            };

            self.publish_logs(&entry, false).await;
            state.published.push_back(entry);
            while state.published.len() > self.config.history_blocks {
                state.published.pop_front();
            }
        }
    }

    async fn publish_logs(&self, entry: &BlockLogs, removed: bool) {
        for log in &entry.logs {
            let Some(event) = self.registry.decode_log(log).await else {
                continue;
            };
            let mut raw_event = log.clone();
            raw_event.removed = Some(removed);
            self.feed
                .publish(ChainEvent::ContractEvent {
                    removed,
                    raw_event,
                    event,
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::abi::{parse_abi, tests::TOKEN_ABI};
    use crate::testing::FakeNode;
    use ethers::types::{Address, Bytes};

    const TOKEN: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";

    fn hash(n: u64) -> H256 {
        H256::from_low_u64_be(n)
    }

    async fn follower(node: Arc<FakeNode>, confirmation_blocks: u64) -> (BlockFollower, Arc<EventFeed>) {
        let registry = Arc::new(ContractRegistry::new());
        registry.register(Some("Token"), TOKEN, TOKEN_ABI).await.unwrap();
        let feed = Arc::new(EventFeed::new(100));
        let config = EventsConfig {
            confirmation_blocks,
            ..Default::default()
        };
        (BlockFollower::new(node, registry, feed.clone(), config), feed)
    }

    fn transfer_log(block_hash: H256, amount: u8) -> Log {
        let abi = parse_abi(TOKEN_ABI).unwrap();
        let mut data = [0u8; 32];
        data[31] = amount;
        Log {
            address: TOKEN.parse().unwrap(),
            topics: vec![
                abi.event("Transfer").unwrap().signature(),
                H256::from(Address::repeat_byte(1)),
                H256::from(Address::repeat_byte(2)),
            ],
            data: Bytes::from(data.to_vec()),
            block_hash: Some(block_hash),
            ..Default::default()
        }
    }

    fn kinds(entries: &[FeedEntry]) -> Vec<String> {
        entries
            .iter()
            .map(|e| match &e.event {
                ChainEvent::NewBlock { block } => format!("new:{}", block.number),
                ChainEvent::BlockRemoved { block } => format!("removed:{}", block.number),
                ChainEvent::ContractEvent { removed, event, .. } => {
                    format!("{}{}", if *removed { "retract:" } else { "event:" }, event.event_name)
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn test_catches_up_in_chain_order() {
        let node = Arc::new(FakeNode::default());
        let (follower, feed) = follower(node.clone(), 0).await;

        node.push_block(10, hash(10), hash(9));
        assert_eq!(follower.poll_once().await.unwrap(), 0);

        node.push_block(11, hash(11), hash(10));
        node.push_block(12, hash(12), hash(11));
        node.push_block(13, hash(13), hash(12));
        assert_eq!(follower.poll_once().await.unwrap(), 3);
        assert_eq!(follower.poll_once().await.unwrap(), 0);

        assert_eq!(kinds(&feed.since(0, 10).await), vec!["new:11", "new:12", "new:13"]);
        assert_eq!(feed.since(2, 10).await.len(), 1);
    }

    #[tokio::test]
    async fn test_events_wait_for_confirmation_depth() {
        let node = Arc::new(FakeNode::default());
        let (follower, feed) = follower(node.clone(), 2).await;

        node.push_block(10, hash(10), hash(9));
        follower.poll_once().await.unwrap();

        node.push_block(11, hash(11), hash(10));
        node.add_log(hash(11), transfer_log(hash(11), 7));
        // Not registered: never fetched
        let mut stranger = transfer_log(hash(11), 1);
        stranger.address = Address::repeat_byte(0x44);
        node.add_log(hash(11), stranger);
        follower.poll_once().await.unwrap();

        node.push_block(12, hash(12), hash(11));
        follower.poll_once().await.unwrap();
        assert_eq!(kinds(&feed.since(0, 10).await), vec!["new:11", "new:12"]);

        node.push_block(13, hash(13), hash(12));
        follower.poll_once().await.unwrap();
        let entries = feed.since(0, 10).await;
        assert_eq!(kinds(&entries), vec!["new:11", "new:12", "new:13", "event:Transfer"]);
        match &entries[3].event {
            ChainEvent::ContractEvent { raw_event, event, .. } => {
                assert_eq!(raw_event.removed, Some(false));
                assert_eq!(
                    event.event_data.get("value"),
                    Some(&serde_json::Value::String("7".to_string()))
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reorg_removes_blocks_and_retracts_events() {
        let node = Arc::new(FakeNode::default());
        let (follower, feed) = follower(node.clone(), 0).await;

        node.push_block(10, hash(10), hash(9));
        follower.poll_once().await.unwrap();
        node.push_block(11, hash(11), hash(10));
        node.add_log(hash(11), transfer_log(hash(11), 3));
        follower.poll_once().await.unwrap();
        node.push_block(12, hash(12), hash(11));
        follower.poll_once().await.unwrap();

        // Competing branch from block 10
        node.push_block(11, hash(111), hash(10));
        node.push_block(12, hash(112), hash(111));
        node.push_block(13, hash(113), hash(112));
        assert_eq!(follower.poll_once().await.unwrap(), 3);

        assert_eq!(
            kinds(&feed.since(0, 20).await),
            vec![
                "new:11",
                "event:Transfer",
                "new:12",
                "removed:12",
                "retract:Transfer",
                "removed:11",
                "new:11",
                "new:12",
                "new:13",
            ]
        );
    }

    #[tokio::test]
    async fn test_reorg_drops_unconfirmed_events() {
        let node = Arc::new(FakeNode::default());
        let (follower, feed) = follower(node.clone(), 5).await;

        node.push_block(10, hash(10), hash(9));
        follower.poll_once().await.unwrap();
        node.push_block(11, hash(11), hash(10));
        node.add_log(hash(11), transfer_log(hash(11), 3));
        follower.poll_once().await.unwrap();

        node.push_block(11, hash(111), hash(10));
        follower.poll_once().await.unwrap();
        for n in 12..=20 {
            node.push_block(n, hash(100 + n), hash(100 + n - 1));
        }
        follower.poll_once().await.unwrap();

        let entries = feed.since(0, 100).await;
        assert!(kinds(&entries).iter().all(|k| !k.contains("Transfer")));
        assert_eq!(kinds(&entries)[..3], ["new:11", "removed:11", "new:11"]);
    }

    #[tokio::test]
    async fn test_missing_parent_retries_next_poll() {
        let node = Arc::new(FakeNode::default());
        let (follower, feed) = follower(node.clone(), 0).await;

        node.push_block(10, hash(10), hash(9));
        follower.poll_once().await.unwrap();
        // Head references a parent the node cannot serve yet
        node.push_block(12, hash(12), hash(11));
        assert_eq!(follower.poll_once().await.unwrap(), 0);

        node.push_block(11, hash(11), hash(10));
        node.push_block(12, hash(12), hash(11));
        assert_eq!(follower.poll_once().await.unwrap(), 2);
        assert_eq!(kinds(&feed.since(0, 10).await), vec!["new:11", "new:12"]);
    }

    #[tokio::test]
    async fn test_feed_is_bounded_and_broadcast() {
        let feed = EventFeed::new(2);
        let mut live = feed.subscribe();
        let new_block = |n: u64| ChainEvent::NewBlock {
            block: BlockRef {
                number: n,
                hash: hash(n),
                parent_hash: hash(n - 1),
            },
        };

        feed.publish(new_block(1)).await;
        assert_eq!(live.recv().await.unwrap().sequence, 1);
        feed.publish(new_block(2)).await;
        feed.publish(new_block(3)).await;

        let buffered = feed.since(0, 10).await;
        assert_eq!(buffered.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![2, 3]);

        let json = serde_json::to_value(&buffered[0]).unwrap();
        assert_eq!(json["type"], "newBlock");
        assert_eq!(json["sequence"], 2);
    }
}
