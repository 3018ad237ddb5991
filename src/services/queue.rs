use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::models::descriptor::JobDescriptor;

/// FIFO of descriptors not yet taken by a worker.
///
/// Shared by all workers of one batch; every access goes through the lock.
pub struct ReadyQueue {
    inner: Mutex<VecDeque<JobDescriptor>>,
}

impl ReadyQueue {
    pub fn new(descriptors: impl IntoIterator<Item = JobDescriptor>) -> Self {
        Self {
            inner: Mutex::new(descriptors.into_iter().collect()),
        }
    }

    /// Take the next descriptor in submission order.
    pub fn dequeue(&self) -> Option<JobDescriptor> {
        self.inner.lock().pop_front()
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.lock().len()
    }

    /// Remove everything still waiting, in order.
    pub fn drain(&self) -> Vec<JobDescriptor> {
        self.inner.lock().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn descriptor(id: &str) -> JobDescriptor {
        JobDescriptor {
            id: id.to_string(),
            source_image_path: PathBuf::from(format!("{id}.png")),
            product_type: "Shoes".to_string(),
            template_key: "minimal".to_string(),
            quality_preset: "standard".to_string(),
            num_outputs: 1,
            enabled: true,
        }
    }

    #[test]
    fn test_fifo_order_and_drain() {
        let queue = ReadyQueue::new(vec![descriptor("a"), descriptor("b"), descriptor("c")]);
        assert_eq!(queue.queue_depth(), 3);

        assert_eq!(queue.dequeue().unwrap().id, "a");
        let rest: Vec<String> = queue.drain().into_iter().map(|d| d.id).collect();
        assert_eq!(rest, vec!["b", "c"]);
        assert!(queue.dequeue().is_none());
    }
}
