//! フレームとコードオブジェクトのプロキシ
//!
//! 3.10ではヒープ上の`PyFrameObject`、3.11以降ではスレッド状態が指す
//! `_PyInterpreterFrame`をたどります。どちらも同じ`PyFrame`として
//! 扱えるようにしています。

use crate::context::RuntimeContext;
use crate::structs::containers::PyTuple;
use crate::structs::object::PyObject;
use crate::structs::strings::PyStr;
use crate::{ProxyError, Result, RuntimeVersion};
use std::sync::Arc;
use tsubaki_target::TargetAccessExt;

/// フレームチェインをたどる上限
const MAX_FRAME_DEPTH: usize = 4096;

/// 実行フレームへのプロキシ
#[derive(Clone)]
pub struct PyFrame {
    ctx: Arc<RuntimeContext>,
    address: u64,
}

impl std::fmt::Debug for PyFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PyFrame(0x{:x})", self.address)
    }
}

impl PyFrame {
    /// フレームプロキシを作成する
    pub fn new(ctx: Arc<RuntimeContext>, address: u64) -> Result<Self> {
        if address == 0 {
            return Err(ProxyError::NullPointer { what: "frame" });
        }
        Ok(Self { ctx, address })
    }

    /// スレッド状態から現在のフレームを取得する
    ///
    /// 3.10は`tstate->frame`、3.11以降は`tstate->cframe->current_frame`です。
    pub fn current_of_thread(ctx: Arc<RuntimeContext>, tstate: u64) -> Result<Option<Self>> {
        let frame_addr = match ctx.version {
            RuntimeVersion::V310 => ctx.read_field_ptr(tstate, "PyThreadState", "frame")?,
            RuntimeVersion::V311 | RuntimeVersion::V312 => {
                let cframe = ctx.read_field_ptr(tstate, "PyThreadState", "cframe")?;
                if cframe == 0 {
                    return Ok(None);
                }
                ctx.read_field_ptr(cframe, "_PyCFrame", "current_frame")?
            }
        };
        if frame_addr == 0 {
            return Ok(None);
        }
        Ok(Some(Self::new(ctx, frame_addr)?))
    }

    fn struct_name(&self) -> &'static str {
        match self.ctx.version {
            RuntimeVersion::V310 => "PyFrameObject",
            _ => "_PyInterpreterFrame",
        }
    }

    /// ターゲット内アドレス
    pub fn address(&self) -> u64 {
        self.address
    }

    /// コードオブジェクトを取得する
    pub fn code(&self) -> Result<PyCode> {
        let code_addr = self.ctx.read_field_ptr(self.address, self.struct_name(), "f_code")?;
        Ok(PyCode::bind(PyObject::new(self.ctx.clone(), code_addr)?))
    }

    /// 呼び出し元フレームを取得する
    pub fn back(&self) -> Result<Option<PyFrame>> {
        let field = match self.ctx.version {
            RuntimeVersion::V310 => "f_back",
            _ => "previous",
        };
        let prev = self.ctx.read_field_ptr(self.address, self.struct_name(), field)?;
        if prev == 0 {
            return Ok(None);
        }
        Ok(Some(Self::new(self.ctx.clone(), prev)?))
    }

    /// フレームチェインを上limit個までたどって収集する
    pub fn chain(&self) -> Result<Vec<PyFrame>> {
        let mut frames = vec![self.clone()];
        let mut current = self.clone();
        while let Some(prev) = current.back()? {
            frames.push(prev.clone());
            current = prev;
            if frames.len() >= MAX_FRAME_DEPTH {
                return Err(ProxyError::Malformed {
                    what: "frame chain",
                    detail: "frame chain exceeds depth limit (cycle?)".to_string(),
                });
            }
        }
        Ok(frames)
    }

    /// 現在の行番号を返す
    ///
    /// 3.10はトレース中に維持される`f_lineno`を読みます。3.11以降は
    /// 行番号表の復元を行わず、関数先頭行を返します（ブレークポイントの
    /// ヒット行はヘルパー側から通知されるため、ここは表示用です）。
    pub fn line_number(&self) -> Result<i32> {
        match self.ctx.version {
            RuntimeVersion::V310 => {
                self.ctx.read_field_i32(self.address, "PyFrameObject", "f_lineno")
            }
            _ => self.code()?.first_lineno(),
        }
    }

    /// ローカル変数を (名前, 値) で読む
    ///
    /// 未初期化スロット（NULL）は省略します。
    pub fn locals(&self) -> Result<Vec<(String, PyObject)>> {
        let code = self.code()?;
        let names = code.var_names()?;
        let nlocals = code.nlocals()?.max(0) as usize;
        let slots_field = match self.ctx.version {
            RuntimeVersion::V310 => self.ctx.layouts.field("PyFrameObject", "f_localsplus")?,
            _ => self.ctx.layouts.field("_PyInterpreterFrame", "localsplus")?,
        };
        let base = self.address + slots_field.offset;

        let mut out = Vec::new();
        for (i, name) in names.iter().enumerate().take(nlocals) {
            let ptr = self.ctx.target.read_pointer(base + (i as u64) * 8)?;
            if ptr == 0 {
                continue;
            }
            out.push((name.clone(), PyObject::new(self.ctx.clone(), ptr)?));
        }
        Ok(out)
    }

    /// 名前からローカル変数スロットを探す
    ///
    /// 見つかった場合は（スロットのアドレス, 現在のオブジェクト
    /// アドレス）を返します。書き換え時に使います。
    pub fn local_slot(&self, name: &str) -> Result<Option<(u64, u64)>> {
        let code = self.code()?;
        let names = code.var_names()?;
        let nlocals = code.nlocals()?.max(0) as usize;
        let slots_field = match self.ctx.version {
            RuntimeVersion::V310 => self.ctx.layouts.field("PyFrameObject", "f_localsplus")?,
            _ => self.ctx.layouts.field("_PyInterpreterFrame", "localsplus")?,
        };
        let base = self.address + slots_field.offset;
        for (i, candidate) in names.iter().enumerate().take(nlocals) {
            if candidate == name {
                let slot = base + (i as u64) * 8;
                let current = self.ctx.target.read_pointer(slot)?;
                return Ok(Some((slot, current)));
            }
        }
        Ok(None)
    }
}

/// コードオブジェクトへのプロキシ
#[derive(Clone, Debug)]
pub struct PyCode {
    object: PyObject,
}

impl PyCode {
    pub fn bind(object: PyObject) -> Self {
        Self { object }
    }

    /// 基底の`PyObject`
    pub fn as_object(&self) -> &PyObject {
        &self.object
    }

    fn read_str_field(&self, field: &'static str) -> Result<String> {
        let ctx = self.object.ctx();
        let ptr = ctx.read_field_ptr(self.object.address(), "PyCodeObject", field)?;
        PyStr::bind(PyObject::new(ctx.clone(), ptr)?).value()
    }

    /// 関数名（`co_name`）
    pub fn name(&self) -> Result<String> {
        self.read_str_field("co_name")
    }

    /// ソースファイル名（`co_filename`）
    pub fn filename(&self) -> Result<String> {
        self.read_str_field("co_filename")
    }

    /// 先頭行番号（`co_firstlineno`）
    pub fn first_lineno(&self) -> Result<i32> {
        self.object
            .ctx()
            .read_field_i32(self.object.address(), "PyCodeObject", "co_firstlineno")
    }

    /// 引数の個数（`co_argcount`）
    pub fn argcount(&self) -> Result<i32> {
        self.object
            .ctx()
            .read_field_i32(self.object.address(), "PyCodeObject", "co_argcount")
    }

    /// ローカル変数の個数（`co_nlocals`）
    pub fn nlocals(&self) -> Result<i32> {
        self.object
            .ctx()
            .read_field_i32(self.object.address(), "PyCodeObject", "co_nlocals")
    }

    /// ローカル変数名の一覧
    ///
    /// 3.10は`co_varnames`、3.11以降は`co_localsplusnames`です。
    pub fn var_names(&self) -> Result<Vec<String>> {
        let ctx = self.object.ctx();
        let field = match ctx.version {
            RuntimeVersion::V310 => "co_varnames",
            _ => "co_localsplusnames",
        };
        let tuple_addr = ctx.read_field_ptr(self.object.address(), "PyCodeObject", field)?;
        let tuple = PyTuple::bind(PyObject::new(ctx.clone(), tuple_addr)?);
        let mut names = Vec::new();
        for item in tuple.items()? {
            match item {
                Some(obj) => names.push(PyStr::bind(obj).value()?),
                None => names.push(String::new()),
            }
        }
        Ok(names)
    }
}
