//! xv6 风格文件系统的写前日志层
//!
//! 文件系统的多块更新通过日志原子地落盘：并发的系统调用被合并成一个事务，
//! 事务中被修改的块先写入磁盘上固定大小的日志区，写日志头即为提交点，
//! 之后再把这些块安装回原位置。挂载时重做已提交但未安装完毕的事务。
//!
//! 块缓存、睡眠锁与自旋锁、块设备驱动都以内核中的形式一并提供；
//! 调度器只通过 [`condvar::WaitQueue`] 接入。

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![warn(rust_2018_idioms)]

pub mod condvar;
pub mod consts;
pub mod driver;
pub mod fs;
pub mod sleeplock;
pub mod spinlock;
