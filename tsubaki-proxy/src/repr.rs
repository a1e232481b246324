//! オブジェクトの文字列表現
//!
//! ランタイムのrepr()をターゲット内で呼ぶことはせず、プロキシで読んだ
//! 内容からデバッガ側で文字列を組み立てます。出力は必ず
//! `max_length`以内に収まり、切り詰めた場合は`...`で終わります。

use crate::structs::{
    PyBaseException, PyBool, PyBytes, PyComplex, PyDict, PyFloat, PyList, PyLong, PyObject,
    PyStr, PyTuple, PyType,
};
use crate::{PyKind, Result};
use std::collections::HashSet;

/// コンテナ表示の要素数上限（超過分は `...` に省略）
const MAX_ELEMENTS: usize = 10;

/// 表示オプション
#[derive(Debug, Clone)]
pub struct ReprOptions {
    /// 出力文字列の最大長（バイト）
    pub max_length: usize,
    /// 整数を16進で表示する
    pub hex_display: bool,
}

impl Default for ReprOptions {
    fn default() -> Self {
        Self {
            max_length: 1024,
            hex_display: false,
        }
    }
}

/// 長さ制限つきの文字列ビルダ
pub struct ReprBuilder {
    out: String,
    max_length: usize,
    done: bool,
    visited: HashSet<u64>,
}

impl ReprBuilder {
    /// ビルダを作成する
    pub fn new(options: &ReprOptions) -> Self {
        Self {
            out: String::new(),
            max_length: options.max_length.max(4),
            done: false,
            visited: HashSet::new(),
        }
    }

    /// 文字列を追記する
    ///
    /// 上限を超える場合は`max_length - 3`までで切り詰めて`...`を付け、
    /// 以後の追記を無視します。
    pub fn append(&mut self, s: &str) {
        if self.done {
            return;
        }
        if self.out.len() + s.len() <= self.max_length - 3 {
            self.out.push_str(s);
            return;
        }
        // 収まらない: 文字境界を守って切り詰める
        let budget = self.max_length - 3;
        for ch in s.chars() {
            if self.out.len() + ch.len_utf8() > budget {
                break;
            }
            self.out.push(ch);
        }
        self.out.push_str("...");
        self.done = true;
    }

    /// 上限に達したかどうか
    pub fn is_full(&self) -> bool {
        self.done
    }

    /// 結果を取り出す
    pub fn finish(self) -> String {
        self.out
    }
}

/// オブジェクトの文字列表現を組み立てる
///
/// 読み取りに失敗した部分は`<unreadable>`として埋め、エラーにはしません。
pub fn render(obj: &PyObject, options: &ReprOptions) -> String {
    let mut builder = ReprBuilder::new(options);
    if write_object(obj, options, &mut builder).is_err() {
        builder.append("<unreadable>");
    }
    builder.finish()
}

fn write_object(obj: &PyObject, options: &ReprOptions, b: &mut ReprBuilder) -> Result<()> {
    if b.is_full() {
        return Ok(());
    }
    match obj.kind_or_other()? {
        PyKind::NoneType => b.append("None"),
        PyKind::Bool => b.append(if PyBool::value(obj)? { "True" } else { "False" }),
        PyKind::Long => {
            let value = PyLong::bind(obj.clone()).value()?;
            if options.hex_display {
                if value < 0 {
                    b.append(&format!("-0x{:x}", -value));
                } else {
                    b.append(&format!("0x{:x}", value));
                }
            } else {
                b.append(&value.to_string());
            }
        }
        PyKind::Float => b.append(&format_float(PyFloat::bind(obj.clone()).value()?)),
        PyKind::Complex => {
            let (re, im) = PyComplex::bind(obj.clone()).value()?;
            if re == 0.0 {
                b.append(&format!("{}j", format_float_bare(im)));
            } else {
                let sign = if im < 0.0 || im.is_sign_negative() { "" } else { "+" };
                b.append(&format!(
                    "({}{}{}j)",
                    format_float_bare(re),
                    sign,
                    format_float_bare(im)
                ));
            }
        }
        PyKind::Str => write_str_literal(&PyStr::bind(obj.clone()).value()?, b),
        PyKind::Bytes => write_bytes_literal(&PyBytes::bind(obj.clone()).value()?, b),
        PyKind::Tuple => write_tuple(obj, options, b)?,
        PyKind::List => write_list(obj, options, b)?,
        PyKind::Dict => write_dict(obj, options, b)?,
        PyKind::Type => {
            let name = PyType::bind(obj.clone()).name()?;
            b.append(&format!("<class '{}'>", name));
        }
        PyKind::Frame => b.append(&format!("<frame at 0x{:x}>", obj.address())),
        PyKind::Code => b.append(&format!("<code object at 0x{:x}>", obj.address())),
        PyKind::Function => b.append(&format!("<function at 0x{:x}>", obj.address())),
        PyKind::Module => b.append(&format!("<module at 0x{:x}>", obj.address())),
        PyKind::BaseException => write_exception(obj, options, b)?,
        PyKind::Other => {
            let type_name = obj
                .type_name()
                .unwrap_or_else(|_| "unknown".to_string());
            b.append(&format!("<{} object at 0x{:x}>", type_name, obj.address()));
        }
    }
    Ok(())
}

fn write_item(item: &Option<PyObject>, options: &ReprOptions, b: &mut ReprBuilder) {
    match item {
        Some(obj) => {
            if write_object(obj, options, b).is_err() {
                b.append("<unreadable>");
            }
        }
        None => b.append("<NULL>"),
    }
}

fn write_tuple(obj: &PyObject, options: &ReprOptions, b: &mut ReprBuilder) -> Result<()> {
    if !b.visited.insert(obj.address()) {
        b.append("...");
        return Ok(());
    }
    let tuple = PyTuple::bind(obj.clone());
    let items = tuple.items()?;
    b.append("(");
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            b.append(", ");
        }
        if i >= MAX_ELEMENTS {
            b.append("...");
            break;
        }
        write_item(item, options, b);
    }
    if items.len() == 1 {
        b.append(",");
    }
    b.append(")");
    b.visited.remove(&obj.address());
    Ok(())
}

fn write_list(obj: &PyObject, options: &ReprOptions, b: &mut ReprBuilder) -> Result<()> {
    if !b.visited.insert(obj.address()) {
        b.append("...");
        return Ok(());
    }
    let list = PyList::bind(obj.clone());
    let items = list.items()?;
    b.append("[");
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            b.append(", ");
        }
        if i >= MAX_ELEMENTS {
            b.append("...");
            break;
        }
        write_item(item, options, b);
    }
    b.append("]");
    b.visited.remove(&obj.address());
    Ok(())
}

fn write_dict(obj: &PyObject, options: &ReprOptions, b: &mut ReprBuilder) -> Result<()> {
    if !b.visited.insert(obj.address()) {
        b.append("...");
        return Ok(());
    }
    let dict = PyDict::bind(obj.clone());
    let entries = dict.entries()?;
    b.append("{");
    for (i, (key, value)) in entries.iter().enumerate() {
        if i > 0 {
            b.append(", ");
        }
        if i >= MAX_ELEMENTS {
            b.append("...");
            break;
        }
        if write_object(key, options, b).is_err() {
            b.append("<unreadable>");
        }
        b.append(": ");
        if write_object(value, options, b).is_err() {
            b.append("<unreadable>");
        }
    }
    b.append("}");
    b.visited.remove(&obj.address());
    Ok(())
}

fn write_exception(obj: &PyObject, options: &ReprOptions, b: &mut ReprBuilder) -> Result<()> {
    let type_name = obj.type_name().unwrap_or_else(|_| "BaseException".to_string());
    b.append(&type_name);
    b.append("(");
    let exc = PyBaseException::bind(obj.clone());
    if let Some(args) = exc.args()? {
        for (i, item) in args.items()?.iter().enumerate() {
            if i > 0 {
                b.append(", ");
            }
            write_item(item, options, b);
        }
    }
    b.append(")");
    Ok(())
}

fn write_str_literal(s: &str, b: &mut ReprBuilder) {
    b.append("'");
    let mut buf = String::new();
    for ch in s.chars() {
        match ch {
            '\\' => buf.push_str("\\\\"),
            '\'' => buf.push_str("\\'"),
            '\n' => buf.push_str("\\n"),
            '\r' => buf.push_str("\\r"),
            '\t' => buf.push_str("\\t"),
            c if (c as u32) < 0x20 => buf.push_str(&format!("\\x{:02x}", c as u32)),
            c => buf.push(c),
        }
        if buf.len() >= 256 {
            b.append(&buf);
            buf.clear();
            if b.is_full() {
                return;
            }
        }
    }
    b.append(&buf);
    b.append("'");
}

fn write_bytes_literal(bytes: &[u8], b: &mut ReprBuilder) {
    b.append("b'");
    let mut buf = String::new();
    for &byte in bytes {
        match byte {
            b'\\' => buf.push_str("\\\\"),
            b'\'' => buf.push_str("\\'"),
            b'\n' => buf.push_str("\\n"),
            b'\r' => buf.push_str("\\r"),
            b'\t' => buf.push_str("\\t"),
            0x20..=0x7e => buf.push(byte as char),
            _ => buf.push_str(&format!("\\x{:02x}", byte)),
        }
        if buf.len() >= 256 {
            b.append(&buf);
            buf.clear();
            if b.is_full() {
                return;
            }
        }
    }
    b.append(&buf);
    b.append("'");
}

/// floatの表示（整数値には`.0`を付ける）
fn format_float(v: f64) -> String {
    format_float_bare(v)
}

fn format_float_bare(v: f64) -> String {
    if v.is_nan() {
        "nan".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "inf".to_string() } else { "-inf".to_string() }
    } else if v == v.trunc() && v.abs() < 1e16 {
        format!("{:.1}", v)
    } else {
        format!("{}", v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_respects_max_length() {
        let options = ReprOptions {
            max_length: 16,
            hex_display: false,
        };
        let mut b = ReprBuilder::new(&options);
        b.append("0123456789");
        b.append("abcdefghij");
        let out = b.finish();
        assert!(out.len() <= 16);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn builder_ignores_appends_after_truncation() {
        let options = ReprOptions {
            max_length: 8,
            hex_display: false,
        };
        let mut b = ReprBuilder::new(&options);
        b.append("aaaaaaaaaa");
        assert!(b.is_full());
        b.append("bbb");
        let out = b.finish();
        assert_eq!(out.len(), 8);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn short_output_is_untouched() {
        let options = ReprOptions::default();
        let mut b = ReprBuilder::new(&options);
        b.append("None");
        assert_eq!(b.finish(), "None");
    }

    #[test]
    fn float_formatting_keeps_trailing_zero() {
        assert_eq!(format_float(1.0), "1.0");
        assert_eq!(format_float(-2.5), "-2.5");
        assert_eq!(format_float(f64::NAN), "nan");
    }
}
