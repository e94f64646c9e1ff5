//! 事件循环：一线程一循环的反应器。
//!
//! # 设计背景（Why）
//! - 通道在创建时被钉到一个循环上、终身不迁移；该通道的全部 I/O 完成与
//!   流水线事件都在循环线程串行执行，Handler 因此免锁。
//! - 跨线程请求一律转为任务投递（`post`）——这是核心提供的唯一封送原语；
//!   `in_loop` 让已在循环线程上的调用方省掉一次排队。
//!
//! # 逻辑解析（How）
//! - 每个 [`EventLoop`] 拥有一个 OS 线程，线程内驱动 current-thread Tokio
//!   运行时加 `LocalSet`：投递的任务按序执行，任务内可 `spawn_local` 长驻
//!   协程（读循环、刷写、定时器）。
//! - [`Timeout`] 的取消采用显式标志：`cancel` 幂等，已取消的回调绝不执行。

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

enum LoopCommand {
    Run(Box<dyn FnOnce() + Send + 'static>),
    Shutdown,
}

struct LoopShared {
    name: String,
    sender: mpsc::UnboundedSender<LoopCommand>,
    thread_id: OnceLock<ThreadId>,
    join: Mutex<Option<JoinHandle<()>>>,
}

/// 单线程事件循环的句柄；克隆开销为一次引用计数。
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<LoopShared>,
}

impl EventLoop {
    /// 启动一个以 `name` 命名的循环线程。
    pub fn spawn(name: impl Into<String>) -> Self {
        let name = name.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<LoopCommand>();
        let shared = Arc::new(LoopShared {
            name: name.clone(),
            sender,
            thread_id: OnceLock::new(),
            join: Mutex::new(None),
        });
        let startup = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                let _ = startup.thread_id.set(std::thread::current().id());
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("构建事件循环运行时失败");
                let local = tokio::task::LocalSet::new();
                local.block_on(&runtime, async move {
                    while let Some(command) = receiver.recv().await {
                        match command {
                            LoopCommand::Run(task) => task(),
                            LoopCommand::Shutdown => break,
                        }
                    }
                });
            })
            .expect("事件循环线程启动失败");
        *shared.join.lock() = Some(handle);
        Self { shared }
    }

    /// 循环名称。
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// 当前线程是否就是本循环的线程。
    pub fn in_loop(&self) -> bool {
        self.shared
            .thread_id
            .get()
            .is_some_and(|id| *id == std::thread::current().id())
    }

    /// 把任务投递到循环线程执行；循环已停止时返回 `false`。
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.shared
            .sender
            .send(LoopCommand::Run(Box::new(task)))
            .is_ok()
    }

    /// 已在循环线程上则就地执行，否则投递。
    pub fn run(&self, task: impl FnOnce() + Send + 'static) {
        if self.in_loop() {
            task();
        } else if !self.post(task) {
            tracing::debug!(event_loop = %self.shared.name, "循环已停止，任务被丢弃");
        }
    }

    /// 在 `delay` 之后于循环线程上执行 `callback`，返回可取消的句柄。
    pub fn schedule(&self, delay: Duration, callback: impl FnOnce() + Send + 'static) -> Timeout {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        self.run(move || {
            tokio::task::spawn_local(async move {
                tokio::time::sleep(delay).await;
                // 取消检查与回调同在循环线程，已取消的定时器不可能再触发。
                if !flag.load(Ordering::SeqCst) {
                    callback();
                }
            });
        });
        Timeout { cancelled }
    }

    /// 停止循环并等待线程退出；从循环线程自身调用时只发停止指令。
    pub fn shutdown(&self) {
        let _ = self.shared.sender.send(LoopCommand::Shutdown);
        if self.in_loop() {
            return;
        }
        if let Some(handle) = self.shared.join.lock().take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop").field("name", &self.shared.name).finish()
    }
}

/// 定时器句柄；取消显式且幂等。
pub struct Timeout {
    cancelled: Arc<AtomicBool>,
}

impl Timeout {
    /// 取消定时器；已触发或已取消时为空操作。
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// 是否已被取消。
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// N 个互相独立的事件循环；通道按轮转分配并终身绑定。
pub struct EventLoopGroup {
    loops: Vec<EventLoop>,
    next: AtomicUsize,
}

impl EventLoopGroup {
    /// 启动 `size` 个以 `prefix-i` 命名的循环。
    pub fn new(size: usize, prefix: &str) -> Self {
        assert!(size > 0, "事件循环组至少包含一个循环");
        let loops = (0..size)
            .map(|i| EventLoop::spawn(format!("{prefix}-{i}")))
            .collect();
        Self {
            loops,
            next: AtomicUsize::new(0),
        }
    }

    /// 轮转取下一个循环。
    pub fn next(&self) -> &EventLoop {
        let at = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        &self.loops[at]
    }

    /// 组内循环数量。
    pub fn len(&self) -> usize {
        self.loops.len()
    }

    /// 组是否为空（构造约束下恒为 `false`）。
    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// 停止组内全部循环。
    pub fn shutdown_all(&self) {
        for event_loop in &self.loops {
            event_loop.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;

    #[test]
    fn posted_tasks_run_on_the_loop_thread() {
        let event_loop = EventLoop::spawn("test-loop");
        let (tx, rx) = std_mpsc::channel();
        let probe = event_loop.clone();
        event_loop.post(move || {
            tx.send(probe.in_loop()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "任务必须在循环线程执行");
        assert!(!event_loop.in_loop());
        event_loop.shutdown();
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let event_loop = EventLoop::spawn("timer-loop");
        let (tx, rx) = std_mpsc::channel::<&'static str>();
        let fired = tx.clone();
        let timeout = event_loop.schedule(Duration::from_millis(30), move || {
            let _ = fired.send("fired");
        });
        timeout.cancel();
        timeout.cancel();
        assert!(timeout.is_cancelled(), "取消必须幂等");
        assert!(
            rx.recv_timeout(Duration::from_millis(200)).is_err(),
            "已取消的定时器回调不得执行"
        );
        event_loop.shutdown();
    }

    #[test]
    fn timer_fires_after_delay() {
        let event_loop = EventLoop::spawn("timer-loop-2");
        let (tx, rx) = std_mpsc::channel();
        let _timeout = event_loop.schedule(Duration::from_millis(10), move || {
            let _ = tx.send(());
        });
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        event_loop.shutdown();
    }

    #[test]
    fn group_assigns_round_robin() {
        let group = EventLoopGroup::new(3, "rr");
        let first = group.next().name().to_string();
        let second = group.next().name().to_string();
        let third = group.next().name().to_string();
        let fourth = group.next().name().to_string();
        assert_eq!(first, fourth, "第四次分配应轮转回第一个循环");
        assert_ne!(first, second);
        assert_ne!(second, third);
        group.shutdown_all();
    }
}
