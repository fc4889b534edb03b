//! 超级块操作

use log::info;
use static_assertions::const_assert;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::condvar::WaitQueue;
use crate::consts::fs::{BSIZE, FSMAGIC, SUPERBLOCK_NO};
use crate::driver::BlockDevice;
use super::{Bcache, FsError};

/// 磁盘上的超级块，位于 1 号块，描述文件系统各区域的布局。
///
/// 挂载时读入一次，之后只读。日志层只关心 `logstart` 与 `nlog` 两个字段。
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct SuperBlock {
    pub magic: u32,      // 文件系统魔数，必须为`FSMAGIC`
    pub size: u32,       // 文件系统映像总块数
    pub nblocks: u32,    // 数据块数量（不含元数据）
    pub ninodes: u32,    // 索引节点总数
    pub nlog: u32,       // 日志块数量
    pub logstart: u32,   // 第一个日志块的块号
    pub inodestart: u32, // 第一个索引节点块的块号
    pub bmapstart: u32,  // 第一个位图块的块号
}

const_assert!(core::mem::size_of::<SuperBlock>() <= BSIZE);

impl SuperBlock {
    /// 从设备 `dev` 读入并校验超级块。
    ///
    /// # 功能说明
    /// 读取 1 号块并按 [`SuperBlock`] 的布局解析，随后检查魔数与日志区范围。
    ///
    /// # 可能的错误
    /// - 魔数不符：[`FsError::BadMagic`]；
    /// - 日志区连一个日志头块都放不下：[`FsError::LogTooSmall`]；
    /// - 日志区越过文件系统末尾：[`FsError::LogOutOfRange`]。
    pub fn read<D: BlockDevice, Q: WaitQueue>(bcache: &Bcache<D, Q>, dev: u32) -> Result<Self, FsError> {
        let buf = bcache.bread(dev, SUPERBLOCK_NO);
        let sb: SuperBlock = buf.read_prefix();
        drop(buf);
        sb.validate()?;

        #[cfg(feature = "verbose_init_info")]
        info!("super block data: {:?}", sb);

        Ok(sb)
    }

    /// 将超级块写入设备 `dev` 的 1 号块，供格式化使用。
    pub fn write<D: BlockDevice, Q: WaitQueue>(&self, bcache: &Bcache<D, Q>, dev: u32) {
        let mut buf = bcache.bread(dev, SUPERBLOCK_NO);
        buf.write_prefix(self);
        buf.bwrite();
        info!("file system: super block written to dev {}", dev);
    }

    fn validate(&self) -> Result<(), FsError> {
        if self.magic != FSMAGIC {
            return Err(FsError::BadMagic(self.magic));
        }
        if self.nlog == 0 {
            return Err(FsError::LogTooSmall);
        }
        if self.logstart as u64 + self.nlog as u64 > self.size as u64 {
            return Err(FsError::LogOutOfRange {
                logstart: self.logstart,
                nlog: self.nlog,
                size: self.size,
            });
        }
        Ok(())
    }

    /// 日志区的起始块号与块数（含日志头块）。
    pub fn read_log(&self) -> (u32, u32) {
        (self.logstart, self.nlog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condvar::SpinQueue;
    use crate::consts::fs::LOGSIZE;
    use crate::driver::ramdisk::RamDisk;

    fn sample() -> SuperBlock {
        SuperBlock {
            magic: FSMAGIC,
            size: 64,
            nblocks: 20,
            ninodes: 16,
            nlog: LOGSIZE as u32 + 1,
            logstart: 2,
            inodestart: 33,
            bmapstart: 35,
        }
    }

    #[test]
    fn written_super_block_reads_back() {
        let disk = RamDisk::<64>::new();
        let bcache: Bcache<_, SpinQueue> = Bcache::new(&disk);
        sample().write(&bcache, 1);
        assert_eq!(SuperBlock::read(&bcache, 1), Ok(sample()));
        assert_eq!(sample().read_log(), (2, LOGSIZE as u32 + 1));
    }

    #[test]
    fn blank_disk_has_bad_magic() {
        let disk = RamDisk::<64>::new();
        let bcache: Bcache<_, SpinQueue> = Bcache::new(&disk);
        assert_eq!(SuperBlock::read(&bcache, 1), Err(FsError::BadMagic(0)));
    }

    #[test]
    fn log_region_is_validated() {
        let mut sb = sample();
        sb.nlog = 0;
        assert_eq!(sb.validate(), Err(FsError::LogTooSmall));

        let mut sb = sample();
        sb.logstart = 40;
        assert_eq!(
            sb.validate(),
            Err(FsError::LogOutOfRange { logstart: 40, nlog: sb.nlog, size: 64 })
        );
    }
}
