//! ELFの読み込み機能

use crate::Result;
use object::{Object, ObjectSection};
use std::fs;
use std::path::{Path, PathBuf};

/// DWARFセクションの型
pub type DwarfSections = gimli::Dwarf<gimli::EndianSlice<'static, gimli::RunTimeEndian>>;

/// ELFローダー
///
/// モジュールのファイルを一度だけ読み込み、シンボルテーブルと
/// DWARFセクションへのアクセスを提供します。
pub struct ElfLoader {
    /// 読み込んだファイルのパス
    path: PathBuf,
    /// オブジェクトファイル
    object_file: object::File<'static>,
}

impl ElfLoader {
    /// ELFファイルを読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file_data = fs::read(path)
            .map_err(|e| anyhow::anyhow!("Failed to read file {:?}: {}", path, e))?;

        let mut loader = Self::parse(file_data)?;
        loader.path = path.to_path_buf();
        Ok(loader)
    }

    /// メモリ上のELFイメージをパースする
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        // モジュールはセッション中ずっと参照されるため、'staticライフタイムを得る
        let data: &'static [u8] = Box::leak(data.into_boxed_slice());

        let object_file = object::File::parse(data)
            .map_err(|e| anyhow::anyhow!("Failed to parse ELF image: {}", e))?;

        Ok(Self {
            path: PathBuf::new(),
            object_file,
        })
    }

    /// 読み込んだファイルのパス
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// オブジェクトファイルへの参照を取得
    pub fn object_file(&self) -> &object::File<'static> {
        &self.object_file
    }

    /// DWARFセクションを読み込む
    ///
    /// セクションはELFイメージのスライスを参照するだけなので、呼び出しごとに構築しても安価です。
    pub fn load_dwarf(&self) -> Result<DwarfSections> {
        let endian = if self.object_file.is_little_endian() {
            gimli::RunTimeEndian::Little
        } else {
            gimli::RunTimeEndian::Big
        };

        let object_file = &self.object_file;
        let load_section = |id: gimli::SectionId| -> Result<gimli::EndianSlice<'static, gimli::RunTimeEndian>> {
            let data = object_file
                .section_by_name(id.name())
                .and_then(|section| section.data().ok())
                .unwrap_or(&[]);
            Ok(gimli::EndianSlice::new(data, endian))
        };

        gimli::Dwarf::load(load_section)
            .map_err(|e| anyhow::anyhow!("Failed to load DWARF sections: {}", e))
    }

    /// DWARFの行情報セクションを持つかどうか
    pub fn has_line_info(&self) -> bool {
        self.object_file.section_by_name(".debug_line").is_some()
    }

    /// PIE（Position Independent Executable）または共有ライブラリかどうかを判定する
    ///
    /// この場合シンボルアドレスはモジュール先頭からのオフセットであり、
    /// 実行時ベースアドレスを加算する必要があります。
    pub fn is_pie(&self) -> bool {
        use object::ObjectKind;

        matches!(self.object_file.kind(), ObjectKind::Dynamic)
    }
}
