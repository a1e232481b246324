//! DWARFからの構造体レイアウト解決
//!
//! インタプリタ本体のデバッグ情報から対象構造体のフィールドオフセットを
//! 読み取ります。デバッグ情報がない・構造体が見つからない場合は呼び出し側が
//! 既知オフセット表にフォールバックします。

use crate::{LayoutSet, ProxyError, Result, RuntimeVersion, StructLayout};
use object::{Object, ObjectSection};
use std::path::Path;

type Reader = gimli::EndianSlice<'static, gimli::RunTimeEndian>;

/// このプロキシ層が解決を試みる構造体名の一覧
const WANTED_STRUCTS: &[&str] = &[
    "PyObject",
    "PyVarObject",
    "PyTypeObject",
    "PyCFunctionObject",
    "PyMethodDef",
    "PyGetSetDescrObject",
    "PyGetSetDef",
    "PyLongObject",
    "PyFloatObject",
    "PyComplexObject",
    "PyBytesObject",
    "PyASCIIObject",
    "PyCompactUnicodeObject",
    "PyTupleObject",
    "PyListObject",
    "PyDictObject",
    "PyDictKeysObject",
    "PyFrameObject",
    "_PyInterpreterFrame",
    "PyCodeObject",
    "PyThreadState",
    "_PyCFrame",
    "PyBaseExceptionObject",
];

/// DWARFレイアウトリーダー
pub struct DwarfLayoutReader {
    dwarf: gimli::Dwarf<Reader>,
}

impl DwarfLayoutReader {
    /// ELFファイルからDWARF情報を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file_data = std::fs::read(path).map_err(|e| ProxyError::Malformed {
            what: "interpreter image",
            detail: format!("{}: {}", path.display(), e),
        })?;

        // DWARFセクションはプロセス存続中参照され続けるためリークさせる
        let file_data: &'static [u8] = Box::leak(file_data.into_boxed_slice());

        let object_file =
            object::File::parse(file_data).map_err(|e| ProxyError::Malformed {
                what: "interpreter image",
                detail: format!("{}: {}", path.display(), e),
            })?;

        let endian = if object_file.is_little_endian() {
            gimli::RunTimeEndian::Little
        } else {
            gimli::RunTimeEndian::Big
        };

        let load_section = |id: gimli::SectionId| -> std::result::Result<Reader, gimli::Error> {
            let data = object_file
                .section_by_name(id.name())
                .and_then(|section| section.data().ok())
                .unwrap_or(&[]);
            Ok(gimli::EndianSlice::new(data, endian))
        };

        let dwarf = gimli::Dwarf::load(load_section).map_err(|e| ProxyError::Malformed {
            what: "dwarf sections",
            detail: e.to_string(),
        })?;

        Ok(Self { dwarf })
    }

    /// 既知オフセット表をDWARFで上書きしたレイアウトセットを構築する
    ///
    /// DWARFで解決できた構造体だけが上書きされるため、不完全な
    /// デバッグ情報でも安全に使えます。
    pub fn resolve(&self, version: RuntimeVersion) -> LayoutSet {
        let mut set = LayoutSet::fallback(version);
        let mut resolved = 0usize;

        for name in WANTED_STRUCTS {
            match self.resolve_struct(name) {
                Ok(Some(layout)) => {
                    set.insert(layout);
                    resolved += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(struct_name = name, error = %e, "dwarf struct resolution failed");
                }
            }
        }

        tracing::debug!(resolved, total = WANTED_STRUCTS.len(), "dwarf layout resolution done");
        set
    }

    /// 名前で構造体を探してレイアウトを抽出する
    pub fn resolve_struct(&self, struct_name: &str) -> Result<Option<StructLayout>> {
        let mut units = self.dwarf.units();
        while let Some(header) = units.next().map_err(dwarf_err)? {
            let unit = self.dwarf.unit(header).map_err(dwarf_err)?;
            let mut entries = unit.entries();
            while let Some((_, entry)) = entries.next_dfs().map_err(dwarf_err)? {
                if entry.tag() != gimli::DW_TAG_structure_type {
                    continue;
                }
                if self.entry_name(&unit, entry).as_deref() != Some(struct_name) {
                    continue;
                }
                let size = self.byte_size(entry).unwrap_or(0);
                let mut layout = StructLayout::new(struct_name, size);
                for (name, offset, field_size) in self.members(&unit, entry)? {
                    layout = layout.with_field(&name, offset, field_size);
                }
                return Ok(Some(layout));
            }
        }
        Ok(None)
    }

    /// 構造体DIEの子メンバを列挙する
    fn members(
        &self,
        unit: &gimli::Unit<Reader>,
        parent: &gimli::DebuggingInformationEntry<Reader>,
    ) -> Result<Vec<(String, u64, u64)>> {
        let mut members = Vec::new();
        let mut tree = unit.entries_tree(Some(parent.offset())).map_err(dwarf_err)?;
        let root = tree.root().map_err(dwarf_err)?;
        let mut children = root.children();
        while let Some(child) = children.next().map_err(dwarf_err)? {
            let entry = child.entry();
            if entry.tag() != gimli::DW_TAG_member {
                continue;
            }
            let Some(name) = self.entry_name(unit, entry) else {
                continue;
            };
            let Some(offset) = self.member_offset(entry) else {
                continue;
            };
            let size = self.member_type_size(unit, entry).unwrap_or(8);
            members.push((name, offset, size));
        }
        Ok(members)
    }

    fn entry_name(
        &self,
        unit: &gimli::Unit<Reader>,
        entry: &gimli::DebuggingInformationEntry<Reader>,
    ) -> Option<String> {
        let attr = entry.attr_value(gimli::DW_AT_name).ok()??;
        let s = self.dwarf.attr_string(unit, attr).ok()?;
        s.to_string().ok().map(|s| s.to_string())
    }

    fn byte_size(&self, entry: &gimli::DebuggingInformationEntry<Reader>) -> Option<u64> {
        match entry.attr_value(gimli::DW_AT_byte_size).ok()?? {
            gimli::AttributeValue::Udata(size) => Some(size),
            _ => None,
        }
    }

    fn member_offset(&self, entry: &gimli::DebuggingInformationEntry<Reader>) -> Option<u64> {
        match entry.attr_value(gimli::DW_AT_data_member_location).ok()?? {
            gimli::AttributeValue::Udata(offset) => Some(offset),
            _ => None,
        }
    }

    /// メンバの型サイズを取得する（型DIEのDW_AT_byte_sizeから）
    fn member_type_size(
        &self,
        unit: &gimli::Unit<Reader>,
        entry: &gimli::DebuggingInformationEntry<Reader>,
    ) -> Option<u64> {
        let attr = entry.attr_value(gimli::DW_AT_type).ok()??;
        let gimli::AttributeValue::UnitRef(offset) = attr else {
            return None;
        };
        let type_entry = unit.entry(offset).ok()?;
        if type_entry.tag() == gimli::DW_TAG_pointer_type {
            return Some(8);
        }
        self.byte_size(&type_entry)
    }
}

fn dwarf_err(e: gimli::Error) -> ProxyError {
    ProxyError::Malformed {
        what: "dwarf data",
        detail: e.to_string(),
    }
}
