//! ランタイム構造体のプロキシ
//!
//! 各モジュールが組み込み型1グループ分のプロキシを提供します。
//! すべてのプロキシは`PyObject`を内包し、レイアウトセット経由で
//! フィールドを読みます。

pub mod containers;
pub mod exception;
pub mod frame;
pub mod numbers;
pub mod object;
pub mod strings;
pub mod type_object;

pub use containers::{PyDict, PyList, PyTuple};
pub use exception::PyBaseException;
pub use frame::{PyCode, PyFrame};
pub use numbers::{PyBool, PyComplex, PyFloat, PyLong};
pub use object::PyObject;
pub use strings::{PyBytes, PyStr};
pub use type_object::PyType;
