//! 广播中心
//!
//! 接收线程调用 [`Hub::publish`] 把每一帧追加到所有订阅者的有界队列：
//!
//! - 订阅者列表是 `ArcSwap` 写时复制的快照，接收线程无锁遍历
//! - 队列满时丢弃该订阅者最旧的一项并累加 `dropped`，生产者从不阻塞
//! - 每个订阅者内部顺序与发布顺序一致，不会重复
//!
//! 流结束时（断开或致命错误）向所有订阅者推送 [`HubEvent::EndOfStream`]
//! 并移除它们；订阅者读完剩余事件后 `recv()` 返回 `None`。

use arc_swap::ArcSwap;
use busview_protocol::{BusFrame, Decoded};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace};

/// 接收到的帧及其（可选的）PGN 解码结果
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedFrame {
    pub frame: BusFrame,
    pub decoded: Option<Decoded>,
}

/// 推送给订阅者的事件
#[derive(Debug, Clone)]
pub enum HubEvent {
    Frame(Arc<ReceivedFrame>),
    EndOfStream { reason: String },
}

#[derive(Debug, Default)]
struct SlotStats {
    dropped: AtomicU64,
}

struct Slot {
    id: u64,
    tx: Sender<HubEvent>,
    /// 同一队列的接收端，用于丢弃最旧项
    drain: Receiver<HubEvent>,
    stats: Arc<SlotStats>,
}

pub struct Hub {
    slots: ArcSwap<Vec<Arc<Slot>>>,
    next_id: AtomicU64,
    capacity: usize,
    /// 所有订阅者（含已分离的）累计丢弃数
    dropped_total: AtomicU64,
}

impl Hub {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: ArcSwap::from_pointee(Vec::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
            dropped_total: AtomicU64::new(0),
        })
    }

    /// 使用默认队列容量订阅
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        self.subscribe_with_capacity(self.capacity)
    }

    pub fn subscribe_with_capacity(self: &Arc<Self>, capacity: usize) -> Subscription {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let stats = Arc::new(SlotStats::default());
        let slot = Arc::new(Slot {
            id,
            tx,
            drain: rx.clone(),
            stats: Arc::clone(&stats),
        });
        self.slots.rcu(|slots| {
            let mut next = Vec::with_capacity(slots.len() + 1);
            next.extend(slots.iter().cloned());
            next.push(Arc::clone(&slot));
            next
        });
        debug!("Subscriber {} attached (capacity {})", id, capacity.max(1));
        Subscription {
            id,
            rx,
            stats,
            hub: Arc::downgrade(self),
        }
    }

    fn detach(&self, id: u64) {
        self.slots.rcu(|slots| {
            slots
                .iter()
                .filter(|s| s.id != id)
                .cloned()
                .collect::<Vec<_>>()
        });
        debug!("Subscriber {} detached", id);
    }

    /// 扇出一帧；从不阻塞
    pub fn publish(&self, frame: Arc<ReceivedFrame>) {
        let slots = self.slots.load();
        for slot in slots.iter() {
            self.deliver(slot, HubEvent::Frame(Arc::clone(&frame)));
        }
    }

    /// 推送流结束标记并移除全部订阅者
    pub fn end_stream(&self, reason: &str) {
        let slots = self.slots.swap(Arc::new(Vec::new()));
        for slot in slots.iter() {
            self.deliver(
                slot,
                HubEvent::EndOfStream {
                    reason: reason.to_string(),
                },
            );
        }
        if !slots.is_empty() {
            debug!("End of stream sent to {} subscriber(s): {}", slots.len(), reason);
        }
    }

    fn deliver(&self, slot: &Slot, mut event: HubEvent) {
        loop {
            match slot.tx.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(returned)) => {
                    event = returned;
                    // 订阅者可能同时在读，只有真正取出时才计数
                    if slot.drain.try_recv().is_ok() {
                        slot.stats.dropped.fetch_add(1, Ordering::Relaxed);
                        self.dropped_total.fetch_add(1, Ordering::Relaxed);
                        trace!("Subscriber {} queue full, dropped oldest", slot.id);
                    }
                },
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.slots.load().len()
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }
}

/// 订阅句柄；drop 时自动分离
pub struct Subscription {
    id: u64,
    rx: Receiver<HubEvent>,
    stats: Arc<SlotStats>,
    hub: Weak<Hub>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 因队列满而丢弃的事件数（单调递增）
    pub fn dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }

    /// 阻塞等待下一事件；流结束且队列读空后返回 `None`
    pub fn recv(&self) -> Option<HubEvent> {
        self.rx.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<HubEvent, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Result<HubEvent, TryRecvError> {
        self.rx.try_recv()
    }

    /// 当前排队的事件数
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.detach(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: u32) -> Arc<ReceivedFrame> {
        Arc::new(ReceivedFrame {
            frame: BusFrame::new_extended(id, &[id as u8]).unwrap(),
            decoded: None,
        })
    }

    fn frame_id(event: HubEvent) -> u32 {
        match event {
            HubEvent::Frame(f) => f.frame.id(),
            HubEvent::EndOfStream { reason } => panic!("unexpected end of stream: {}", reason),
        }
    }

    #[test]
    fn test_fan_out_to_all_subscribers() {
        let hub = Hub::new(16);
        let a = hub.subscribe();
        let b = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);

        for id in 1..=3 {
            hub.publish(frame(id));
        }
        for sub in [&a, &b] {
            let ids: Vec<u32> = (0..3).map(|_| frame_id(sub.try_recv().unwrap())).collect();
            assert_eq!(ids, vec![1, 2, 3]);
        }
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let hub = Hub::new(16);
        let slow = hub.subscribe_with_capacity(4);
        let fast = hub.subscribe();

        for id in 1..=10 {
            hub.publish(frame(id));
            // 快订阅者每帧都取走，不受慢订阅者影响
            assert_eq!(frame_id(fast.try_recv().unwrap()), id);
        }

        assert_eq!(slow.dropped(), 6);
        assert_eq!(fast.dropped(), 0);
        assert_eq!(hub.dropped_total(), 6);
        let ids: Vec<u32> = (0..4).map(|_| frame_id(slow.try_recv().unwrap())).collect();
        assert_eq!(ids, vec![7, 8, 9, 10]);
    }

    #[test]
    fn test_drop_detaches() {
        let hub = Hub::new(8);
        let a = hub.subscribe();
        {
            let _b = hub.subscribe();
            assert_eq!(hub.subscriber_count(), 2);
        }
        assert_eq!(hub.subscriber_count(), 1);
        hub.publish(frame(1));
        assert_eq!(frame_id(a.try_recv().unwrap()), 1);
    }

    #[test]
    fn test_end_of_stream() {
        let hub = Hub::new(2);
        let sub = hub.subscribe();
        hub.publish(frame(1));
        hub.publish(frame(2));
        hub.end_stream("bus off");

        assert_eq!(hub.subscriber_count(), 0);
        // 队列满时结束标记挤掉最旧帧
        assert_eq!(frame_id(sub.recv().unwrap()), 2);
        assert!(matches!(
            sub.recv(),
            Some(HubEvent::EndOfStream { reason }) if reason == "bus off"
        ));
        assert!(sub.recv().is_none());
    }

    #[test]
    fn test_concurrent_attach_while_publishing() {
        let hub = Hub::new(1024);
        let stable = hub.subscribe_with_capacity(10_000);

        let publisher = {
            let hub = Arc::clone(&hub);
            std::thread::spawn(move || {
                for id in 0..5_000 {
                    hub.publish(frame(id));
                }
            })
        };
        for _ in 0..200 {
            let transient = hub.subscribe_with_capacity(4);
            drop(transient);
        }
        publisher.join().unwrap();

        let ids: Vec<u32> = std::iter::from_fn(|| stable.try_recv().ok())
            .map(frame_id)
            .collect();
        assert_eq!(ids.len(), 5_000);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(hub.subscriber_count(), 1);
    }
}
