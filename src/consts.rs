//! 内核常量

pub mod fs {
    /// 磁盘块大小（字节）
    pub const BSIZE: usize = 1024;

    /// 单个文件系统操作最多写入的块数
    pub const MAXOPBLOCKS: usize = 10;

    /// 日志头最多可记录的块数（即日志容量）
    pub const LOGSIZE: usize = MAXOPBLOCKS * 3;

    /// 块缓存中的缓冲块数量。
    /// 日志写满时 `LOGSIZE` 个块被钉住，其余缓冲块留给提交过程与进行中的操作。
    pub const NBUF: usize = MAXOPBLOCKS * 4;

    /// 文件系统魔数
    pub const FSMAGIC: u32 = 0x10203040;

    /// 根设备号
    pub const ROOTDEV: u32 = 1;

    /// 超级块所在的块号（0 号块为引导块）
    pub const SUPERBLOCK_NO: u32 = 1;
}
