//! 文件系统模块
//!
//! 目前只包含块缓存、超级块与日志层；上层的位图、索引节点等操作
//! 通过 [`Log::begin_op`] / [`Log::write`] / [`Log::end_op`] 使用日志。

use core::fmt;

use ::log::info;

use crate::condvar::WaitQueue;
use crate::driver::BlockDevice;

mod bio;
mod log;
mod superblock;

pub use bio::{Bcache, Buf, BufData, BufPin};
pub use self::log::{Log, LogOp, LogStats, Phase};
pub use superblock::SuperBlock;

/// 挂载文件系统时可能出现的错误。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// 超级块魔数不符，通常意味着设备没有被格式化
    BadMagic(u32),
    /// 日志区连一个日志头块都放不下
    LogTooSmall,
    /// 日志区越过了文件系统映像的末尾
    LogOutOfRange { logstart: u32, nlog: u32, size: u32 },
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::BadMagic(magic) => write!(f, "invalid file system magic num {:#x}", magic),
            FsError::LogTooSmall => write!(f, "log region too small for a header block"),
            FsError::LogOutOfRange { logstart, nlog, size } => write!(
                f,
                "log region {}..{} exceeds file system size {}",
                logstart,
                *logstart as u64 + *nlog as u64,
                size
            ),
        }
    }
}

/// 已挂载的文件系统，持有超级块与日志。
pub struct FileSystem<'a, D: BlockDevice, Q: WaitQueue> {
    sb: SuperBlock,
    log: Log<'a, D, Q>,
}

impl<'a, D: BlockDevice, Q: WaitQueue> FileSystem<'a, D, Q> {
    /// 读取磁盘超级块信息，并根据需要进行日志恢复。
    /// 每个设备只能挂载一次，且必须在任何文件系统操作之前完成。
    pub fn mount(bcache: &'a Bcache<D, Q>, dev: u32) -> Result<Self, FsError> {
        let sb = SuperBlock::read(bcache, dev)?;
        let log = Log::mount(bcache, dev, &sb);
        info!("file system: setup done");
        Ok(Self { sb, log })
    }

    pub fn superblock(&self) -> &SuperBlock {
        &self.sb
    }

    pub fn log(&self) -> &Log<'a, D, Q> {
        &self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condvar::SpinQueue;
    use crate::consts::fs::{FSMAGIC, LOGSIZE, ROOTDEV};
    use crate::driver::ramdisk::RamDisk;
    use std::string::ToString;

    #[test]
    fn mount_rejects_unformatted_disk() {
        let disk = RamDisk::<64>::new();
        let bcache: Bcache<_, SpinQueue> = Bcache::new(&disk);
        let err = FileSystem::mount(&bcache, ROOTDEV).err();
        assert_eq!(err, Some(FsError::BadMagic(0)));
        assert_eq!(err.unwrap().to_string(), "invalid file system magic num 0x0");
    }

    #[test]
    fn mount_formatted_disk() {
        let disk = RamDisk::<64>::new();
        let bcache: Bcache<_, SpinQueue> = Bcache::new(&disk);
        let sb = SuperBlock {
            magic: FSMAGIC,
            size: 64,
            nblocks: 31,
            ninodes: 0,
            nlog: LOGSIZE as u32 + 1,
            logstart: 33,
            inodestart: 2,
            bmapstart: 2,
        };
        sb.write(&bcache, ROOTDEV);

        let fs = FileSystem::mount(&bcache, ROOTDEV).unwrap();
        assert_eq!(fs.superblock(), &sb);
        assert_eq!(fs.log().capacity(), LOGSIZE);
        assert_eq!(fs.log().phase(), Phase::Idle);
    }

    #[test]
    fn out_of_range_log_message() {
        let err = FsError::LogOutOfRange { logstart: 40, nlog: 31, size: 64 };
        assert_eq!(err.to_string(), "log region 40..71 exceeds file system size 64");
    }
}
