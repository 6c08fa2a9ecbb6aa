use serde::de::DeserializeOwned;

use super::Handle;
use crate::error::SqlHandleError;
use crate::options::{QueryOption, wildcard};
use crate::record::{self, Record};
use crate::statement::{
    Compiled, SelectKind, Statement, render_count, render_exists, render_pluck, render_select,
};

impl Handle {
    /// Bound statement plus `opts`, targeting `T`'s table unless one is
    /// already bound. A non-zero primary key on `dest` filters by it.
    fn lookup_statement<T: Record>(
        &self,
        dest: &T,
        opts: &[QueryOption],
    ) -> Result<Statement, SqlHandleError> {
        let mut stmt = self
            .build_options(opts)
            .with_default_table(T::TABLE, T::PRIMARY_KEY);
        if let Some(key) = record::primary_key(dest)? {
            stmt = stmt.where_eq(T::PRIMARY_KEY, key);
        }
        Ok(stmt)
    }

    fn compile_lookup<T: Record>(
        &self,
        dest: &T,
        opts: &[QueryOption],
        kind: SelectKind,
    ) -> Result<Compiled, SqlHandleError> {
        let stmt = self.lookup_statement(dest, opts)?;
        match stmt.raw_sql() {
            Some(raw) => Ok(raw.clone()),
            None => render_select(&stmt, self.dialect(), kind),
        }
    }

    /// Compile the statement [`find_one`](Handle::find_one) would run,
    /// without running it.
    ///
    /// # Errors
    /// Serialisation errors from `dest` propagate.
    pub fn compile_find_one<T: Record>(
        &self,
        dest: &T,
        opts: &[QueryOption],
    ) -> Result<Compiled, SqlHandleError> {
        self.compile_lookup(dest, opts, SelectKind::First)
    }

    /// Load the first matching row, by primary key unless an ordering option
    /// says otherwise.
    ///
    /// # Errors
    /// `RecordNotFound` when nothing matches.
    pub async fn find_one<T: Record>(
        &self,
        dest: &mut T,
        opts: &[QueryOption],
    ) -> Result<(), SqlHandleError> {
        let compiled = self.compile_find_one(&*dest, opts)?;
        let rows = self.fetch(&compiled).await?;
        let row = rows.first().ok_or(SqlHandleError::RecordNotFound)?;
        *dest = record::decode_row(row)?;
        Ok(())
    }

    /// Replace `dest` with every matching row. No match leaves it empty.
    ///
    /// # Errors
    /// Engine and decoding errors propagate.
    pub async fn find_many<T: Record>(
        &self,
        dest: &mut Vec<T>,
        opts: &[QueryOption],
    ) -> Result<(), SqlHandleError> {
        let stmt = self
            .build_options(opts)
            .with_default_table(T::TABLE, T::PRIMARY_KEY);
        let compiled = match stmt.raw_sql() {
            Some(raw) => raw.clone(),
            None => render_select(&stmt, self.dialect(), SelectKind::Find)?,
        };
        let rows = self.fetch(&compiled).await?;
        let decoded = rows
            .results
            .iter()
            .map(record::decode_row)
            .collect::<Result<Vec<T>, _>>()?;
        *dest = decoded;
        Ok(())
    }

    /// Load one column of every matching row.
    ///
    /// # Errors
    /// `MissingTable` unless a model, table, or table option is bound.
    pub async fn pluck<V: DeserializeOwned>(
        &self,
        column: &str,
        dest: &mut Vec<V>,
        opts: &[QueryOption],
    ) -> Result<(), SqlHandleError> {
        let stmt = self.build_options(opts);
        let compiled = render_pluck(&stmt, self.dialect(), column)?;
        let rows = self.fetch(&compiled).await?;
        *dest = rows
            .results
            .iter()
            .map(record::decode_first_column)
            .collect::<Result<Vec<V>, _>>()?;
        Ok(())
    }

    /// Number of matching rows. Paging options do not affect the count.
    ///
    /// # Errors
    /// `MissingTable` unless a model, table, or table option is bound.
    pub async fn count(&self, opts: &[QueryOption]) -> Result<i64, SqlHandleError> {
        let stmt = self.build_options(opts);
        let compiled = render_count(&stmt)?;
        let rows = self.fetch(&compiled).await?;
        match rows.first() {
            Some(row) => record::decode_first_column(row),
            None => Ok(0),
        }
    }

    /// Whether any row matches.
    ///
    /// The single-row lookup is only compiled, with a forced `SELECT *`, and
    /// the engine runs nothing but `SELECT EXISTS(<lookup>)`.
    ///
    /// # Errors
    /// Engine errors propagate.
    pub async fn exists<T: Record>(
        &self,
        dest: &T,
        opts: &[QueryOption],
    ) -> Result<bool, SqlHandleError> {
        let mut opts = opts.to_vec();
        opts.push(wildcard());
        let lookup = self.compile_lookup(dest, &opts, SelectKind::Take)?;
        let rows = self.fetch(&render_exists(lookup)).await?;
        Ok(rows
            .first()
            .and_then(|row| row.get_by_index(0))
            .and_then(crate::types::RowValues::as_bool)
            .unwrap_or(false))
    }

    /// Decode the first row of the bound query into any shape. No row leaves
    /// `dest` untouched.
    ///
    /// # Errors
    /// `MissingTable` when neither raw SQL nor a table is bound.
    pub async fn scan<T: DeserializeOwned>(&self, dest: &mut T) -> Result<(), SqlHandleError> {
        let rows = self.fetch(&self.compile_scan()?).await?;
        if let Some(row) = rows.first() {
            *dest = record::decode_row(row)?;
        }
        Ok(())
    }

    /// Decode every row of the bound query.
    ///
    /// # Errors
    /// `MissingTable` when neither raw SQL nor a table is bound.
    pub async fn scan_all<T: DeserializeOwned>(
        &self,
        dest: &mut Vec<T>,
    ) -> Result<(), SqlHandleError> {
        let rows = self.fetch(&self.compile_scan()?).await?;
        *dest = rows
            .results
            .iter()
            .map(record::decode_row)
            .collect::<Result<Vec<T>, _>>()?;
        Ok(())
    }

    fn compile_scan(&self) -> Result<Compiled, SqlHandleError> {
        let stmt = self.statement();
        match stmt.raw_sql() {
            Some(raw) => Ok(raw.clone()),
            None => render_select(stmt, self.dialect(), SelectKind::Find),
        }
    }
}
