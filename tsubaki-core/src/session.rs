//! 接続済みプロセスのセッション
//!
//! プロセスIDごとに1つ作られ、ターゲットアクセス・モジュール表・
//! ランタイムコンテキスト・ブレークポイント表・ステップ調停器を
//! まとめて所有します。コンポーネントはこの構造体から明示的に
//! 依存を受け取ります。

use std::sync::mpsc::Receiver;
use std::sync::Arc;

use tsubaki_bus::{pair, verify_registry, BusMessage, Endpoint};
use tsubaki_proxy::{DwarfLayoutReader, LayoutSet, RuntimeContext, RuntimeVersion};
use tsubaki_target::{
    ImageSymbols, ModuleKind, ModuleMap, Process, ProcessMemory, ScratchArena, TargetAccess,
    Thread, ThreadId,
};

use crate::breakpoints::BreakpointTable;
use crate::eval::ExecutionControl;
use crate::helper::HelperExports;
use crate::options::{InspectorOptions, OptionsHandle};
use crate::release::DecrefQueue;
use crate::stepping::{StepDeps, SteppingCoordinator};
use crate::Result;

/// ヘルパー共有ライブラリのファイル名
const HELPER_MODULE_NAME: &str = "libtsubaki_helper";

/// スレッド状態リスト走査の上限
const MAX_THREAD_STATES: usize = 1024;

/// モジュールパスの分類
pub fn classify_module(path: &str) -> ModuleKind {
    let name = path.rsplit('/').next().unwrap_or(path);
    if name.contains(HELPER_MODULE_NAME) {
        ModuleKind::Helper
    } else if name.contains("python") {
        ModuleKind::Interpreter
    } else {
        ModuleKind::Other
    }
}

/// 接続済みプロセスのセッション
pub struct DebugSession {
    pub process: Process,
    pub target: Arc<dyn TargetAccess>,
    pub modules: ModuleMap,
    pub interpreter_symbols: ImageSymbols,
    pub ctx: Arc<RuntimeContext>,
    pub helper: HelperExports,
    pub arena: ScratchArena,
    pub breakpoints: BreakpointTable,
    pub coordinator: SteppingCoordinator,
    pub decrefs: DecrefQueue,
    pub options: OptionsHandle,
    options_rx: Receiver<InspectorOptions>,
    /// デバッガ側のバス端点
    pub bus: Endpoint,
    /// ヘルパーへの転送層に渡す側の端点
    remote_bus: Option<Endpoint>,
}

impl DebugSession {
    /// 既存プロセスにアタッチしてセッションを構築する
    pub fn attach(pid: i32, options: OptionsHandle) -> Result<Self> {
        verify_registry()?;
        let process = Process::attach(pid)?;
        Self::from_process(process, options)
    }

    fn from_process(process: Process, options: OptionsHandle) -> Result<Self> {
        let pid = process.pid();
        let target: Arc<dyn TargetAccess> = Arc::new(ProcessMemory::new(pid));
        let modules = ModuleMap::snapshot(pid, classify_module)?;

        let interpreter = modules
            .find_kind(ModuleKind::Interpreter)
            .ok_or_else(|| anyhow::anyhow!("no interpreter module found in process {}", pid))?;
        let version = RuntimeVersion::detect(&interpreter.path)?;
        tracing::info!(pid, version = version.as_str(), path = %interpreter.path, "interpreter detected");

        let interpreter_symbols = ImageSymbols::load(&interpreter.path, interpreter.base)?;
        let layouts = match DwarfLayoutReader::load(&interpreter.path) {
            Ok(reader) => reader.resolve(version),
            Err(e) => {
                tracing::warn!(error = %e, "no usable DWARF; using fallback layouts");
                LayoutSet::fallback(version)
            }
        };
        let ctx =
            RuntimeContext::from_symbols(target.clone(), version, layouts, &interpreter_symbols)?;

        let helper_module = modules
            .find_kind(ModuleKind::Helper)
            .ok_or_else(|| anyhow::anyhow!("helper module not loaded in process {}", pid))?;
        let helper_symbols = ImageSymbols::load(&helper_module.path, helper_module.base)?;
        let helper = HelperExports::resolve(&helper_symbols)?;
        helper.publish_frame_offsets(target.as_ref(), &ctx)?;
        let arena = ScratchArena::new(helper.scratch_base, helper.scratch_size);

        let (bus, remote_bus) = pair();
        bus.send(&BusMessage::CreateRuntime {
            interpreter_base: interpreter.base,
        })?;

        let options_rx = options.subscribe();
        let session = Self {
            process,
            target,
            modules,
            interpreter_symbols,
            ctx,
            helper,
            arena,
            breakpoints: BreakpointTable::new(),
            coordinator: SteppingCoordinator::new(),
            decrefs: DecrefQueue::new(),
            options,
            options_rx,
            bus,
            remote_bus: Some(remote_bus),
        };

        // ヘルパーがまだスレッド状態を観測していない場合は失敗しうる。
        // その場合はトレース関数の登録を最初の停止時まで先送りする
        if let Err(e) = session.register_trace_func() {
            tracing::warn!(error = %e, "trace registration deferred");
        }
        Ok(session)
    }

    /// ヘルパー転送層に渡すリモート側端点を引き取る
    pub fn take_remote_endpoint(&mut self) -> Option<Endpoint> {
        self.remote_bus.take()
    }

    /// ステップ調停器へ渡す依存の束
    /// ステップ依存一式と調停器を同時に借りる
    pub fn stepping(&mut self) -> (StepDeps<'_>, &mut SteppingCoordinator) {
        (
            StepDeps {
                target: self.target.as_ref(),
                modules: &self.modules,
                ctx: &self.ctx,
                interpreter_symbols: &self.interpreter_symbols,
                helper: &self.helper,
                bus: &self.bus,
            },
            &mut self.coordinator,
        )
    }

    /// 変更された検査オプションをヘルパー側へ転送する
    ///
    /// 複数回変更されていた場合は最新の値だけを送ります。
    pub fn forward_option_changes(&self) -> Result<()> {
        let mut latest = None;
        while let Ok(opts) = self.options_rx.try_recv() {
            latest = Some(opts);
        }
        if let Some(opts) = latest {
            self.bus.send(&BusMessage::SetDisplayOptions {
                hex_display: opts.hex_display,
                hide_native_frames: opts.hide_native_frames,
            })?;
        }
        Ok(())
    }

    /// 現在のスレッド状態オブジェクトのアドレス
    ///
    /// ヘルパーがトレース関数内で追従している値を読みます。
    pub fn current_tstate(&self) -> Result<u64> {
        use tsubaki_target::TargetAccessExt;
        Ok(self.target.read_typed::<u64>(self.helper.current_tstate)?)
    }

    /// 既知の全スレッド状態にトレース関数を登録する
    pub fn register_trace_func(&self) -> Result<usize> {
        register_tracing(
            self.target.as_ref(),
            &self.ctx,
            &self.helper,
            &self.interpreter_symbols,
            self.current_tstate()?,
        )
    }

    /// ブレークポイント表の変更をターゲットへ反映する
    pub fn sync_breakpoints(&self) -> Result<()> {
        self.breakpoints
            .sync_to_target(self.target.as_ref(), &self.helper)
    }

    /// 遅延解放キューをターゲットへ反映する
    pub fn flush_decrefs(&mut self) -> Result<usize> {
        self.decrefs
            .flush(self.target.as_ref(), &mut self.arena, &self.helper)
    }

    /// 実行制御ハンドルを作る
    pub fn control(&self) -> SessionControl<'_> {
        SessionControl {
            process: &self.process,
        }
    }
}

/// 全スレッド状態にヘルパーのトレース関数を登録する
///
/// `tstate`から`prev`リンクで先頭まで戻り、`next`リンクで全スレッド
/// 状態を辿って`c_tracefunc`を書き込みます。3.10では各スレッドの
/// `use_tracing`と大域カウンタ`_Py_TracingPossible`、3.11以降では
/// cframeの`use_tracing`を併せて立てます。戻り値は登録数です。
pub fn register_tracing(
    target: &dyn TargetAccess,
    ctx: &RuntimeContext,
    helper: &HelperExports,
    interpreter_symbols: &ImageSymbols,
    tstate: u64,
) -> Result<usize> {
    use tsubaki_target::TargetAccessExt;

    if tstate == 0 {
        return Ok(0);
    }

    // リスト先頭まで戻る
    let mut head = tstate;
    for _ in 0..MAX_THREAD_STATES {
        let prev = ctx.read_field_ptr(head, "PyThreadState", "prev")?;
        if prev == 0 {
            break;
        }
        head = prev;
    }

    let tracefunc_off = ctx.layouts.field("PyThreadState", "c_tracefunc")?.offset;
    let traceobj_off = ctx.layouts.field("PyThreadState", "c_traceobj")?.offset;
    let mut registered = 0usize;
    let mut cursor = head;
    let mut visited = 0usize;
    while cursor != 0 && visited < MAX_THREAD_STATES {
        visited += 1;
        // 登録済みのスレッド状態は飛ばす（停止のたびに再実行されるため）
        let current = target.read_typed::<u64>(cursor + tracefunc_off)?;
        if current == helper.trace_func {
            cursor = ctx.read_field_ptr(cursor, "PyThreadState", "next")?;
            continue;
        }
        target.write_typed::<u64>(cursor + tracefunc_off, &helper.trace_func)?;
        target.write_typed::<u64>(cursor + traceobj_off, &0)?;
        match ctx.version {
            RuntimeVersion::V310 => {
                let use_tracing = ctx.layouts.field("PyThreadState", "use_tracing")?.offset;
                target.write_typed::<i32>(cursor + use_tracing, &1)?;
            }
            RuntimeVersion::V311 | RuntimeVersion::V312 => {
                let cframe = ctx.read_field_ptr(cursor, "PyThreadState", "cframe")?;
                if cframe != 0 {
                    let use_tracing = ctx.layouts.field("_PyCFrame", "use_tracing")?.offset;
                    target.write_typed::<u8>(cframe + use_tracing, &1)?;
                }
            }
        }
        registered += 1;
        cursor = ctx.read_field_ptr(cursor, "PyThreadState", "next")?;
    }

    // 3.10はトレース可否を大域カウンタでも数えている
    if ctx.version == RuntimeVersion::V310 {
        if let Some(addr) = interpreter_symbols.try_lookup("_Py_TracingPossible") {
            let current = target.read_typed::<i32>(addr)?;
            target.write_typed::<i32>(addr, &(current + registered as i32))?;
        }
    }

    if registered > 0 {
        tracing::info!(registered, "trace function registered on thread states");
    }
    Ok(registered)
}

/// ptraceベースの実行制御
pub struct SessionControl<'a> {
    process: &'a Process,
}

impl ExecutionControl for SessionControl<'_> {
    fn resume_thread(&mut self, thread: ThreadId) -> Result<()> {
        Thread::new(thread).resume()?;
        Ok(())
    }

    fn suspend_all(&mut self) -> Result<()> {
        for tid in Thread::list(self.process.pid())? {
            Thread::new(tid).suspend()?;
        }
        Ok(())
    }

    fn terminate(&mut self) -> Result<()> {
        self.process.terminate()?;
        Ok(())
    }
}
