//! 日志头
//!
//! 日志区第 0 块存放日志头，第 1..=len 块依次存放日志头所列各块的副本。

use arrayvec::ArrayVec;
use static_assertions::const_assert;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::consts::fs::{BSIZE, LOGSIZE};

/// 磁盘上的日志头布局。
#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
pub(super) struct RawLogHeader {
    /// 已记录的块数量
    pub(super) len: u32,
    /// 被当前事务修改的块号，仅前 `len` 项有效
    pub(super) blocknos: [u32; LOGSIZE],
}

const_assert!(core::mem::size_of::<RawLogHeader>() < BSIZE);

/// 日志头中的一项：块号，以及正常事务中对该块缓存的钉住。
///
/// 崩溃恢复时从磁盘读出的日志项没有对应的钉住。
pub(super) struct LogEntry<P> {
    pub(super) blockno: u32,
    pub(super) pin: Option<P>,
}

/// 内存中的日志头，事务进行期间是权威副本。
pub(super) struct LogHeader<P> {
    entries: ArrayVec<LogEntry<P>, LOGSIZE>,
}

impl<P> Default for LogHeader<P> {
    fn default() -> Self {
        Self { entries: ArrayVec::new() }
    }
}

impl<P> LogHeader<P> {
    pub(super) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(super) fn contains(&self, blockno: u32) -> bool {
        self.entries.iter().any(|e| e.blockno == blockno)
    }

    pub(super) fn blocknos(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.iter().map(|e| e.blockno)
    }

    /// 追加一个新块。调用者负责先做吸收检查与容量检查。
    pub(super) fn push(&mut self, blockno: u32, pin: Option<P>) {
        debug_assert!(!self.contains(blockno));
        if self.entries.try_push(LogEntry { blockno, pin }).is_err() {
            panic!("log: too big a transaction");
        }
    }

    /// 按日志顺序取出全部日志项，日志头随之清空。
    pub(super) fn drain(&mut self) -> arrayvec::Drain<'_, LogEntry<P>, LOGSIZE> {
        self.entries.drain(..)
    }

    pub(super) fn to_raw(&self) -> RawLogHeader {
        let mut raw = RawLogHeader { len: self.len() as u32, blocknos: [0; LOGSIZE] };
        for (dst, entry) in raw.blocknos.iter_mut().zip(self.entries.iter()) {
            *dst = entry.blockno;
        }
        raw
    }

    /// 由磁盘上的日志头构造内存副本，`capacity` 为日志区实际能容纳的块数。
    pub(super) fn from_raw(raw: &RawLogHeader, capacity: usize) -> Self {
        let len = raw.len as usize;
        if len > capacity {
            panic!("log: corrupted log header with {} blocks, capacity {}", len, capacity);
        }
        let mut header = Self::default();
        for &blockno in &raw.blocknos[..len] {
            if header.contains(blockno) {
                panic!("log: corrupted log header lists block {} twice", blockno);
            }
            header.push(blockno, None);
        }
        header
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    #[test]
    fn raw_header_keeps_order() {
        let mut header: LogHeader<()> = LogHeader::default();
        for blockno in [7, 3, 11] {
            header.push(blockno, Some(()));
        }
        let raw = header.to_raw();
        assert_eq!(raw.len, 3);
        assert_eq!(&raw.blocknos[..4], &[7, 3, 11, 0]);

        let restored: LogHeader<()> = LogHeader::from_raw(&raw, LOGSIZE);
        assert_eq!(restored.blocknos().collect::<Vec<_>>(), [7, 3, 11]);
        assert!(restored.entries.iter().all(|e| e.pin.is_none()));
    }

    #[test]
    fn drain_empties_header() {
        let mut header: LogHeader<()> = LogHeader::default();
        header.push(1, None);
        header.push(2, None);
        let drained: Vec<u32> = header.drain().map(|e| e.blockno).collect();
        assert_eq!(drained, [1, 2]);
        assert!(header.is_empty());
        assert_eq!(header.to_raw().len, 0);
    }

    #[test]
    #[should_panic(expected = "corrupted log header")]
    fn oversized_raw_header_is_fatal() {
        let raw = RawLogHeader { len: 5, blocknos: [0; LOGSIZE] };
        let _: LogHeader<()> = LogHeader::from_raw(&raw, 4);
    }

    #[test]
    #[should_panic(expected = "too big a transaction")]
    fn push_past_capacity_is_fatal() {
        let mut header: LogHeader<()> = LogHeader::default();
        for blockno in 0..=LOGSIZE as u32 {
            header.push(blockno, None);
        }
    }
}
