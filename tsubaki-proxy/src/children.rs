//! 値の子要素列挙
//!
//! 変数ツリー表示のための (名前, 子オブジェクト) の列挙です。遅延では
//! なく呼び出し時点のスナップショットで、ターゲットが走った後に再度
//! 呼ぶと別の結果になりえます。

use crate::repr::{render, ReprOptions};
use crate::structs::{PyBaseException, PyDict, PyList, PyObject, PyTuple};
use crate::{PyKind, Result};

/// 辞書キーを名前として表示するときの長さ上限
const KEY_NAME_LENGTH: usize = 64;

/// オブジェクトの子要素を (名前, 値) で列挙する
///
/// 子を持たない型は空列を返します。個々の要素の読み取り失敗はその
/// 要素を飛ばすだけで、列挙全体は失敗しません。
pub fn children(obj: &PyObject) -> Result<Vec<(String, PyObject)>> {
    match obj.kind_or_other()? {
        PyKind::Tuple => indexed_children(PyTuple::bind(obj.clone()).items()?),
        PyKind::List => indexed_children(PyList::bind(obj.clone()).items()?),
        PyKind::Dict => {
            let key_options = ReprOptions {
                max_length: KEY_NAME_LENGTH,
                hex_display: false,
            };
            let mut out = Vec::new();
            for (key, value) in PyDict::bind(obj.clone()).entries()? {
                out.push((format!("[{}]", render(&key, &key_options)), value));
            }
            Ok(out)
        }
        PyKind::BaseException => {
            let mut out = Vec::new();
            if let Some(args) = PyBaseException::bind(obj.clone()).args()? {
                out.push(("args".to_string(), args.as_object().clone()));
            }
            Ok(out)
        }
        _ => Ok(Vec::new()),
    }
}

fn indexed_children(items: Vec<Option<PyObject>>) -> Result<Vec<(String, PyObject)>> {
    Ok(items
        .into_iter()
        .enumerate()
        .filter_map(|(i, item)| item.map(|obj| (format!("[{}]", i), obj)))
        .collect())
}
