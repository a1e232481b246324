//! デバッガコマンド

/// デバッガコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// ブレークポイントを設定（`file.py:line`）
    Break(String, i32),
    /// ブレークポイントを削除
    Delete(usize),
    /// ブレークポイント一覧
    Breakpoints,
    /// 実行継続
    Continue,
    /// ステップイン
    StepInto,
    /// ステップオーバー
    StepOver,
    /// ステップアウト
    StepOut,
    /// ステップの取り消し
    CancelStep,
    /// 混在バックトレース表示
    Backtrace,
    /// ローカル変数表示
    Locals,
    /// 値の表示（変数名）
    Print(String),
    /// 値の書き換え（変数名, リテラル）
    Set(String, String),
    /// ターゲット内での式評価
    Eval(String),
    /// 16進表示の切り替え
    HexDisplay(bool),
    /// ネイティブフレーム表示の切り替え
    NativeFrames(bool),
    /// ヘルプ表示
    Help,
    /// 終了
    Quit,
}

impl Command {
    /// コマンド文字列をパースする
    pub fn parse(input: &str) -> Option<Self> {
        let parts: Vec<&str> = input.trim().split_whitespace().collect();
        if parts.is_empty() {
            return None;
        }

        match parts[0] {
            "break" | "b" => {
                let spec = parts.get(1)?;
                let (file, line) = spec.rsplit_once(':')?;
                let line: i32 = line.parse().ok()?;
                Some(Command::Break(file.to_string(), line))
            }
            "delete" | "d" => {
                let id: usize = parts.get(1)?.parse().ok()?;
                Some(Command::Delete(id))
            }
            "breakpoints" | "info" => Some(Command::Breakpoints),
            "continue" | "c" => Some(Command::Continue),
            "step" | "s" => Some(Command::StepInto),
            "next" | "n" => Some(Command::StepOver),
            "finish" | "out" => Some(Command::StepOut),
            "cancel" => Some(Command::CancelStep),
            "backtrace" | "bt" => Some(Command::Backtrace),
            "locals" | "l" => Some(Command::Locals),
            "print" | "p" => Some(Command::Print(parts.get(1)?.to_string())),
            "set" => {
                let name = parts.get(1)?;
                if parts.len() < 3 {
                    return None;
                }
                Some(Command::Set(name.to_string(), parts[2..].join(" ")))
            }
            "eval" | "e" => {
                if parts.len() < 2 {
                    return None;
                }
                Some(Command::Eval(parts[1..].join(" ")))
            }
            "hex" => Some(Command::HexDisplay(parts.get(1) != Some(&"off"))),
            "native" => Some(Command::NativeFrames(parts.get(1) != Some(&"off"))),
            "help" | "h" | "?" => Some(Command::Help),
            "quit" | "q" | "exit" => Some(Command::Quit),
            _ => None,
        }
    }

    /// ヘルプテキスト
    pub fn help_text() -> &'static str {
        "Commands:\n\
         \x20 break <file>:<line>   set a breakpoint\n\
         \x20 delete <id>           remove a breakpoint\n\
         \x20 breakpoints           list breakpoints\n\
         \x20 continue              resume execution\n\
         \x20 step                  step into\n\
         \x20 next                  step over\n\
         \x20 finish                step out\n\
         \x20 cancel                cancel the active step\n\
         \x20 backtrace             show the mixed call stack\n\
         \x20 locals                show local variables\n\
         \x20 print <name>          render a local variable\n\
         \x20 set <name> <literal>  overwrite a local variable\n\
         \x20 eval <expr>           evaluate in the target\n\
         \x20 hex [on|off]          toggle hex display\n\
         \x20 native [on|off]       toggle native frames\n\
         \x20 quit                  exit the debugger"
    }
}
