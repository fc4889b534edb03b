//! 日志层
//!
//! 简单的重做日志，允许多个文件系统调用并发执行。
//!
//! 一个日志事务包含多个文件系统调用的更新；只有在没有任何调用仍处于
//! [`Log::begin_op`] 与 [`Log::end_op`] 之间时才会提交，因此提交时不必考虑
//! 尚未完成的调用的修改。
//!
//! 磁盘上的日志格式：
//! ```text
//! 日志头块：块 A、B、C... 的块号
//! 块 A 的副本
//! 块 B 的副本
//! 块 C 的副本
//! ...
//! ```
//! 日志追加是同步的。

use core::mem;

use arrayvec::ArrayVec;
use log::{debug, info, trace};

use crate::condvar::{Condvar, WaitQueue};
use crate::consts::fs::{LOGSIZE, MAXOPBLOCKS};
use crate::driver::BlockDevice;
use crate::spinlock::SpinLock;
use super::bio::{Bcache, Buf, BufPin};
use super::SuperBlock;

mod header;

use header::{LogHeader, RawLogHeader};


/// 日志子系统的状态机。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// 没有进行中的文件系统操作，日志头为空
    Idle,
    /// 有 `n`（`n >= 1`）个文件系统操作正在向当前事务写入
    Accumulating(u32),
    /// 最后一个操作已结束，提交正在进行；此时禁止新的操作进入
    Committing,
}

impl Phase {
    fn outstanding(self) -> u32 {
        match self {
            Phase::Accumulating(n) => n,
            Phase::Idle | Phase::Committing => 0,
        }
    }
}

/// 日志统计信息。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogStats {
    /// 写入过数据的提交次数（空事务不计）
    pub commits: u64,
    /// 被安装回原位置的块总数（含崩溃恢复）
    pub installed: u64,
}

struct LogState<'a, D: BlockDevice, Q: WaitQueue> {
    phase: Phase,
    /// 当前事务的日志头；提交期间被移出，由提交者独占
    header: LogHeader<BufPin<'a, D, Q>>,
    stats: LogStats,
}

impl<'a, D: BlockDevice, Q: WaitQueue> LogState<'a, D, Q> {
    /// 若再接纳一个操作不会有耗尽日志空间的风险，则接纳它。
    ///
    /// 每个操作按最坏情况预留 `MAXOPBLOCKS` 个块。
    fn admit(&mut self) -> bool {
        if self.phase == Phase::Committing {
            return false;
        }
        let outstanding = self.phase.outstanding();
        if self.header.len() + (outstanding as usize + 1) * MAXOPBLOCKS > LOGSIZE {
            return false;
        }
        self.phase = Phase::Accumulating(outstanding + 1);
        true
    }
}

/// 文件系统日志，挂载后在内核生命周期内一直存在。
///
/// `Log` 由 [`Log::mount`] 显式构造，并以共享引用的方式交给所有文件系统操作。
/// 日志区的位置、大小以及设备号在挂载后不再改变；`outstanding`、提交状态
/// 与日志头都由内部自旋锁保护，只有提交过程在不持锁的情况下独占日志头。
pub struct Log<'a, D: BlockDevice, Q: WaitQueue> {
    bcache: &'a Bcache<D, Q>,
    /// 所在磁盘设备的编号
    dev: u32,
    /// 日志区在磁盘中的起始块号，即日志头块
    start: u32,
    /// 日志区的块数（包括日志头块和数据块）
    size: u32,
    state: SpinLock<LogState<'a, D, Q>>,
    /// 等待日志空间或等待提交结束的操作在此睡眠
    cond: Condvar<Q>,
}

impl<'a, D: BlockDevice, Q: WaitQueue> Log<'a, D, Q> {
    /// 初始化日志系统并执行崩溃恢复。
    ///
    /// # 功能说明
    /// 在文件系统挂载时调用且只调用一次，必须早于任何 [`Log::begin_op`]。
    /// 从超级块取得日志区的起始位置与大小，随后立即执行恢复：
    /// 若日志头中仍记录着已提交但未安装完毕的事务，则将其重做。
    ///
    /// # 参数
    /// - `bcache`: 日志所在设备的块缓存；
    /// - `dev`: 日志所在的块设备编号；
    /// - `sb`: 已读入的超级块。
    ///
    /// # 可能的错误
    /// 日志区连日志头块都放不下时触发 panic。超级块在 [`SuperBlock::read`]
    /// 中已做过同样的检查，这里的 panic 只会由调用者传入伪造的超级块触发。
    pub fn mount(bcache: &'a Bcache<D, Q>, dev: u32, sb: &SuperBlock) -> Self {
        let (start, size) = sb.read_log();
        if size < 1 {
            panic!("log: log region too small for a header block");
        }
        let mut log = Self {
            bcache,
            dev,
            start,
            size,
            state: SpinLock::new(LogState {
                phase: Phase::Idle,
                header: LogHeader::default(),
                stats: LogStats::default(),
            }, "log"),
            cond: Condvar::new(),
        };
        log.recover();
        log
    }

    /// 日志头最多能记录的块数。
    pub fn capacity(&self) -> usize {
        LOGSIZE.min(self.size as usize - 1)
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn bcache(&self) -> &'a Bcache<D, Q> {
        self.bcache
    }

    /// 读取本设备上的一块，返回的缓冲块可以直接交给 [`Log::write`]。
    pub fn bread(&self, blockno: u32) -> Buf<'a, D, Q> {
        self.bcache.bread(self.dev, blockno)
    }

    /// 在每次文件系统调用开始时调用。
    ///
    /// # 功能说明
    /// 通常只是把进行中的操作数加一后返回。若日志正在提交，
    /// 或者按每个操作最多写 `MAXOPBLOCKS` 块估算、再接纳一个操作可能耗尽日志空间，
    /// 则在条件变量上睡眠，直到某个 [`Log::end_op`] 唤醒后重新检查。
    ///
    /// # 流程解释
    /// 1. 加锁；
    /// 2. 循环判断能否接纳：提交中，或 `len + (outstanding + 1) * MAXOPBLOCKS > LOGSIZE` 时睡眠；
    /// 3. 可以接纳时进入 [`Phase::Accumulating`]，解锁返回。
    ///
    /// 唤醒是广播式的，因此每次醒来都要重新判断条件。调用不会失败，
    /// 也没有超时：活性依赖于其他操作最终调用 `end_op`。
    pub fn begin_op(&self) {
        let mut guard = self.state.lock();
        while !guard.admit() {
            // 提交中，或此操作可能耗尽日志空间：等待提交结束
            guard = self.cond.wait(guard);
        }
    }

    /// 非阻塞版本的 [`Log::begin_op`]：按相同规则判断能否接纳，不能时立即返回 `false`。
    pub fn try_begin_op(&self) -> bool {
        self.state.lock().admit()
    }

    /// 开始一次文件系统操作，返回的 [`LogOp`] 被丢弃时自动调用 [`Log::end_op`]。
    pub fn op(&self) -> LogOp<'_, 'a, D, Q> {
        self.begin_op();
        LogOp { log: self }
    }

    /// 在每次文件系统调用结束时调用；若这是最后一个进行中的操作则提交事务。
    ///
    /// # 功能说明
    /// 与 [`Log::begin_op`] 配对使用。进行中的操作数减一后：
    /// - 若仍有其他操作，唤醒所有等待者（预留空间已减少），直接返回；
    /// - 若归零，进入 [`Phase::Committing`]，释放锁后同步提交，
    ///   完成后重新加锁回到 [`Phase::Idle`] 并唤醒所有等待者。
    ///
    /// 提交不持锁进行，因为磁盘 I/O 可能睡眠，而持有自旋锁时不允许睡眠。
    /// `Committing` 状态保证提交期间没有其他操作能修改日志头。
    ///
    /// # 可能的错误
    /// - 日志正在提交时调用：panic；
    /// - 没有与之配对的 `begin_op`：panic。
    pub fn end_op(&self) {
        let mut guard = self.state.lock();
        let outstanding = match guard.phase {
            Phase::Committing => panic!("log: end fs op while the log is committing"),
            Phase::Idle => panic!("log: end fs op without a matching begin"),
            Phase::Accumulating(n) => n - 1,
        };

        if outstanding > 0 {
            guard.phase = Phase::Accumulating(outstanding);
            // begin_op() 可能在等待日志空间，outstanding 减少后预留空间也随之减少
            self.cond.notify_all();
            return;
        }

        guard.phase = Phase::Committing;
        let mut header = mem::take(&mut guard.header);
        drop(guard);

        let installed = self.commit(&mut header);

        let mut guard = self.state.lock();
        guard.header = header;
        guard.phase = Phase::Idle;
        if installed > 0 {
            guard.stats.commits += 1;
            guard.stats.installed += installed as u64;
        }
        self.cond.notify_all();
    }

    /// 将被修改的缓冲块登记到当前事务中，替代直接调用 `bwrite`。
    ///
    /// # 功能说明
    /// 调用者已修改 `buf` 的数据，并在之后照常释放它。本函数只记录块号，
    /// 并钉住该块，使其在提交前不会被回收；真正的磁盘写入由提交过程完成。
    /// 同一事务中多次写入同一块只记录一次（日志吸收），提交时写入的总是该块最新的内容。
    ///
    /// 典型用法：
    /// ```text
    /// let mut buf = log.bread(blockno);
    /// 修改 buf 的数据
    /// log.write(&buf);
    /// drop(buf);
    /// ```
    ///
    /// # 可能的错误
    /// - 当前没有进行中的文件系统操作：panic；
    /// - 事务记录的块数将超出日志容量：panic；
    /// - `buf` 不属于本日志所在的设备：panic。
    pub fn write(&self, buf: &Buf<'a, D, Q>) {
        if buf.read_dev() != self.dev {
            panic!("log: write of block on dev {} to log on dev {}", buf.read_dev(), self.dev);
        }
        let blockno = buf.read_blockno();

        let mut guard = self.state.lock();
        if guard.phase.outstanding() < 1 {
            panic!("log: this log write is out of recording");
        }

        if guard.header.contains(blockno) {
            trace!("log: block {} absorbed", blockno);
            return;
        }
        if guard.header.len() >= self.capacity() {
            panic!("log: too big a transaction");
        }
        guard.header.push(blockno, Some(buf.pin()));
        trace!("log: block {} recorded at slot {}", blockno, guard.header.len());
    }

    /// 当前进行中的文件系统操作数。
    pub fn outstanding(&self) -> u32 {
        self.state.lock().phase.outstanding()
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    /// 当前事务已记录的块号，按日志顺序排列。
    pub fn pending(&self) -> ArrayVec<u32, LOGSIZE> {
        self.state.lock().header.blocknos().collect()
    }

    pub fn stats(&self) -> LogStats {
        self.state.lock().stats
    }

    /// 提交事务，返回安装的块数。
    ///
    /// 以下步骤严格按序执行，每一步完成后才开始下一步：
    /// 1. [`Log::write_log`]：把缓存中的块复制到日志区；
    /// 2. [`Log::write_head`]：写日志头，这是真正的提交点；
    /// 3. [`Log::install_trans`]：把日志块安装回原位置并解除钉住；
    /// 4. 清空日志头并再次写盘，抹去事务记录。
    fn commit(&self, header: &mut LogHeader<BufPin<'a, D, Q>>) -> usize {
        if header.is_empty() {
            return 0;
        }
        let len = header.len();
        debug!("log: committing {} blocks", len);
        self.write_log(header);
        self.write_head(header);
        self.install_trans(header);
        self.write_head(header);
        debug!("log: commit done");
        len
    }

    /// 将缓存中被修改的块复制到日志区第 `1..=len` 块。
    fn write_log(&self, header: &LogHeader<BufPin<'a, D, Q>>) {
        for (tail, blockno) in header.blocknos().enumerate() {
            let mut to = self.bread(self.start + 1 + tail as u32);
            let from = self.bread(blockno);
            to.copy_from_slice(&from);
            to.bwrite();
        }
    }

    /// 从磁盘读取日志头。
    fn read_head<P>(&self) -> LogHeader<P> {
        let buf = self.bread(self.start);
        let raw: RawLogHeader = buf.read_prefix();
        LogHeader::from_raw(&raw, self.capacity())
    }

    /// 将内存中的日志头写入磁盘。
    /// 日志头非空时，这是当前事务真正被提交的时间点。
    fn write_head<P>(&self, header: &LogHeader<P>) {
        let mut buf = self.bread(self.start);
        buf.write_prefix(&header.to_raw());
        buf.bwrite();
    }

    /// 将日志中已提交的块复制回它们原本的位置，日志头随之清空。
    ///
    /// 正常提交时每个日志项都带有钉住，对应的块写回后立即解除钉住；
    /// 崩溃恢复时日志项没有钉住，只复制数据。
    fn install_trans<P>(&self, header: &mut LogHeader<P>) {
        for (tail, entry) in header.drain().enumerate() {
            let log_buf = self.bread(self.start + 1 + tail as u32);
            let mut disk_buf = self.bread(entry.blockno);
            disk_buf.copy_from_slice(&log_buf);
            disk_buf.bwrite();
            drop(entry.pin);
        }
    }

    /// 崩溃恢复：重做已提交但可能未安装完毕的事务，然后清空日志。
    ///
    /// 对干净的日志重复执行是无害的：不会安装任何块，只会重写一个空的日志头。
    fn recover(&mut self) {
        info!("file system: checking logs");
        let mut header: LogHeader<BufPin<'a, D, Q>> = self.read_head();
        let len = header.len();
        if len > 0 {
            info!("file system: recovering {} blocks from logs", len);
        } else {
            info!("file system: no need to recover");
        }
        self.install_trans(&mut header);
        self.write_head(&header);

        let state = self.state.get_mut();
        state.stats.installed += len as u64;
        state.header = header;
    }
}

/// 一次文件系统操作的作用域，丢弃时调用 [`Log::end_op`]。
pub struct LogOp<'l, 'a, D: BlockDevice, Q: WaitQueue> {
    log: &'l Log<'a, D, Q>,
}

impl<'l, 'a, D: BlockDevice, Q: WaitQueue> LogOp<'l, 'a, D, Q> {
    pub fn bread(&self, blockno: u32) -> Buf<'a, D, Q> {
        self.log.bread(blockno)
    }

    pub fn write(&self, buf: &Buf<'a, D, Q>) {
        self.log.write(buf);
    }
}

impl<'l, 'a, D: BlockDevice, Q: WaitQueue> Drop for LogOp<'l, 'a, D, Q> {
    fn drop(&mut self) {
        self.log.end_op();
    }
}
