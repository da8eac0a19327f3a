use bytes::{Buf, BufMut};

use crate::error::{Error, Result};
use crate::varint::{get_lenenc_string, get_varuint, put_lenenc_string, put_varuint};

/// One column in a table schema. Columns may nest (repeated/record columns,
/// as cstable's original `TableSchema` supports); `children` is empty for a
/// leaf column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub type_tag: String,
    /// 0 means unspecified.
    pub type_size: u32,
    pub nullable: bool,
    pub children: Vec<Column>,
}

impl Column {
    pub fn leaf(name: impl Into<String>, type_tag: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            type_tag: type_tag.into(),
            type_size: 0,
            nullable,
            children: Vec::new(),
        }
    }

    fn encode(&self, buf: &mut impl BufMut) {
        put_lenenc_string(buf, &self.name);
        put_lenenc_string(buf, &self.type_tag);
        put_varuint(buf, self.type_size as u64);
        buf.put_u8(self.nullable as u8);
        put_varuint(buf, self.children.len() as u64);
        for child in &self.children {
            child.encode(buf);
        }
    }

    fn decode(buf: &mut impl Buf) -> Result<Self> {
        let name = get_lenenc_string(buf)?;
        let type_tag = get_lenenc_string(buf)?;
        let type_size = get_varuint(buf)? as u32;
        if !buf.has_remaining() {
            return Err(Error::Protocol("truncated column".into()));
        }
        let nullable = buf.get_u8() != 0;
        let num_children = get_varuint(buf)?;
        let mut children = Vec::with_capacity(num_children as usize);
        for _ in 0..num_children {
            children.push(Column::decode(buf)?);
        }
        Ok(Self {
            name,
            type_tag,
            type_size,
            nullable,
            children,
        })
    }
}

/// An ordered, immutable table schema. Owned by the arena for its lifetime;
/// `flatten` is computed once, at header-construction time, and cached there
/// rather than recomputed on every access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Result<Self> {
        if columns.is_empty() {
            return Err(Error::InvalidArgument("schema must have at least one column".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for c in &columns {
            if c.name.is_empty() {
                return Err(Error::InvalidArgument("column name must not be empty".into()));
            }
            if !seen.insert(c.name.as_str()) {
                return Err(Error::InvalidArgument(format!("duplicate column name: {}", c.name)));
            }
        }
        Ok(Self { columns })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Flattens nested/repeated columns to one entry per leaf, dotting
    /// parent/child names together (`parent.child`). Mirrors the original
    /// `TableSchema::flatColumns()`.
    pub fn flatten(&self) -> Vec<Column> {
        let mut out = Vec::new();
        for col in &self.columns {
            flatten_into(col, None, &mut out);
        }
        out
    }

    pub(crate) fn encode(&self, buf: &mut impl BufMut) {
        put_varuint(buf, self.columns.len() as u64);
        for col in &self.columns {
            col.encode(buf);
        }
    }

    pub(crate) fn decode(buf: &mut impl Buf) -> Result<Self> {
        let num_columns = get_varuint(buf)?;
        let mut columns = Vec::with_capacity(num_columns as usize);
        for _ in 0..num_columns {
            columns.push(Column::decode(buf)?);
        }
        Schema::new(columns)
    }
}

fn flatten_into(col: &Column, prefix: Option<&str>, out: &mut Vec<Column>) {
    let flat_name = match prefix {
        Some(p) => format!("{p}.{}", col.name),
        None => col.name.clone(),
    };
    if col.children.is_empty() {
        out.push(Column {
            name: flat_name,
            type_tag: col.type_tag.clone(),
            type_size: col.type_size,
            nullable: col.nullable,
            children: Vec::new(),
        });
    } else {
        for child in &col.children {
            flatten_into(child, Some(&flat_name), out);
        }
    }
}
