use std::collections::VecDeque;

use foldhash::{HashMap, HashMapExt};

use crate::Attachment;

/// Restricts which completed attachments a caller is willing to receive.
///
/// `None` accepts every attachment of the requested kind.
pub type Candidates<'a, A> = Option<&'a dyn Fn(&A) -> bool>;

pub(crate) fn accepts<A>(candidates: Candidates<'_, A>, attachment: &A) -> bool
where
    A: Attachment,
{
    candidates.is_none_or(|accept| accept(attachment))
}

/// Holds completions that nobody asked for yet, per kind, in the order they completed.
///
/// There is no bound on the size. A caller that keeps asking for fewer
/// completions than arrive will grow this indefinitely; `len()` exposes the size for monitoring.
#[derive(Debug)]
pub(crate) struct DetainBuffer<A>
where
    A: Attachment,
{
    by_kind: HashMap<A::Kind, VecDeque<A>>,
}

impl<A> DetainBuffer<A>
where
    A: Attachment,
{
    pub(crate) fn new() -> Self {
        Self {
            by_kind: HashMap::new(),
        }
    }

    pub(crate) fn detain(&mut self, attachment: A) {
        self.by_kind
            .entry(attachment.kind())
            .or_default()
            .push_back(attachment);
    }

    /// Moves up to `limit` accepted attachments of `kind` into `out`, oldest first.
    /// Attachments that are not accepted keep their relative order.
    pub(crate) fn drain_into(
        &mut self,
        kind: A::Kind,
        candidates: Candidates<'_, A>,
        limit: usize,
        out: &mut Vec<A>,
    ) -> usize {
        if limit == 0 {
            return 0;
        }

        let Some(queue) = self.by_kind.get_mut(&kind) else {
            return 0;
        };

        let mut kept = VecDeque::with_capacity(queue.len());
        let mut moved: usize = 0;

        while let Some(attachment) = queue.pop_front() {
            if accepts(candidates, &attachment) {
                out.push(attachment);
                moved = moved.saturating_add(1);

                if moved == limit {
                    kept.append(queue);
                    break;
                }
            } else {
                kept.push_back(attachment);
            }
        }

        if kept.is_empty() {
            self.by_kind.remove(&kind);
        } else {
            *queue = kept;
        }

        moved
    }

    pub(crate) fn len(&self, kind: A::Kind) -> usize {
        self.by_kind.get(&kind).map_or(0, VecDeque::len)
    }

    pub(crate) fn total_len(&self) -> usize {
        self.by_kind.values().map(VecDeque::len).sum()
    }

    /// Releases every detained attachment without delivering it.
    pub(crate) fn release_all(&mut self) -> usize {
        let mut released: usize = 0;

        for (_, queue) in self.by_kind.drain() {
            for mut attachment in queue {
                attachment.release();
                released = released.saturating_add(1);
            }
        }

        released
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::TaggedAttachment;

    const FETCH: u8 = 1;
    const UPDATE: u8 = 2;

    fn tags(attachments: &[TaggedAttachment<u8>]) -> Vec<u64> {
        attachments.iter().map(TaggedAttachment::tag).collect()
    }

    #[test]
    fn drains_in_fifo_order_per_kind() {
        let mut buffer = DetainBuffer::new();
        buffer.detain(TaggedAttachment::new(FETCH, 1));
        buffer.detain(TaggedAttachment::new(UPDATE, 2));
        buffer.detain(TaggedAttachment::new(FETCH, 3));
        buffer.detain(TaggedAttachment::new(FETCH, 4));

        let mut out = Vec::new();
        assert_eq!(buffer.drain_into(FETCH, None, 2, &mut out), 2);
        assert_eq!(tags(&out), [1, 3]);

        assert_eq!(buffer.len(FETCH), 1);
        assert_eq!(buffer.len(UPDATE), 1);
        assert_eq!(buffer.total_len(), 2);

        out.clear();
        assert_eq!(buffer.drain_into(FETCH, None, 10, &mut out), 1);
        assert_eq!(tags(&out), [4]);
        assert_eq!(buffer.len(FETCH), 0);
    }

    #[test]
    fn skipped_candidates_keep_their_order() {
        let mut buffer = DetainBuffer::new();
        for tag in 1..=5 {
            buffer.detain(TaggedAttachment::new(FETCH, tag));
        }

        let odd = |a: &TaggedAttachment<u8>| a.tag() % 2 == 1;
        let mut out = Vec::new();
        assert_eq!(buffer.drain_into(FETCH, Some(&odd), 10, &mut out), 3);
        assert_eq!(tags(&out), [1, 3, 5]);

        out.clear();
        buffer.drain_into(FETCH, None, 10, &mut out);
        assert_eq!(tags(&out), [2, 4]);
    }

    #[test]
    fn zero_limit_moves_nothing() {
        let mut buffer = DetainBuffer::new();
        buffer.detain(TaggedAttachment::new(FETCH, 1));

        let mut out = Vec::new();
        assert_eq!(buffer.drain_into(FETCH, None, 0, &mut out), 0);
        assert_eq!(buffer.len(FETCH), 1);
    }

    #[test]
    fn release_all_releases_without_delivery() {
        let mut buffer = DetainBuffer::new();
        let a = TaggedAttachment::new(FETCH, 1);
        let b = TaggedAttachment::new(UPDATE, 2);
        buffer.detain(a.clone());
        buffer.detain(b.clone());

        assert_eq!(buffer.release_all(), 2);

        assert!(a.is_released());
        assert!(b.is_released());
        assert_eq!(a.ready_count(), 0);
        assert_eq!(buffer.total_len(), 0);
    }
}
