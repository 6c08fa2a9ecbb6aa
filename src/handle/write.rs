use super::Handle;
use crate::error::SqlHandleError;
use crate::options::QueryOption;
use crate::record::{self, Record};
use crate::statement::{Statement, render_delete, render_insert, render_update, render_upsert};
use crate::types::RowValues;

impl Handle {
    fn write_statement<T: Record>(&self, opts: &[QueryOption]) -> Statement {
        self.build_options(opts).with_default_table(T::TABLE, T::PRIMARY_KEY)
    }

    /// Insert one row and write the assigned identity back into `record`.
    ///
    /// A zero primary key is left for the engine to assign. Returns the
    /// number of rows inserted, which is 0 when a [`no_conflict`] option
    /// skipped the row.
    ///
    /// [`no_conflict`]: crate::options::no_conflict
    ///
    /// # Errors
    /// Constraint violations and other engine errors propagate.
    pub async fn insert<T: Record>(
        &self,
        record: &mut T,
        opts: &[QueryOption],
    ) -> Result<usize, SqlHandleError> {
        let stmt = self.write_statement::<T>(opts);
        self.insert_with(&stmt, record).await
    }

    async fn insert_with<T: Record>(
        &self,
        stmt: &Statement,
        record: &mut T,
    ) -> Result<usize, SqlHandleError> {
        let pk = stmt.primary_key_column().to_owned();
        let values: Vec<(String, RowValues)> = record::columns(&*record)?
            .into_iter()
            .filter(|(column, value)| !(column == &pk && value.is_zero()))
            .collect();
        let compiled = render_insert(stmt, &values)?;
        let rows = self.fetch(&compiled).await?;
        if let Some(key) = rows.first().and_then(|row| row.get(&pk))
            && !key.is_null()
        {
            record::set_field(record, &pk, key.clone())?;
        }
        Ok(rows.results.len())
    }

    /// Insert every record, in order, writing identities back.
    ///
    /// Runs inside a transaction unless the handle is already scoped to one,
    /// so either every row is persisted or none is.
    ///
    /// # Errors
    /// The first failing insert's error; earlier rows are rolled back.
    pub async fn insert_all<T: Record>(
        &self,
        records: &mut [T],
        opts: &[QueryOption],
    ) -> Result<usize, SqlHandleError> {
        if records.is_empty() {
            return Ok(0);
        }
        let stmt = self.write_statement::<T>(opts);
        if self.in_transaction() {
            return self.insert_each(&stmt, records).await;
        }
        self.tx(|tx| async move { tx.insert_each(&stmt, records).await }).await
    }

    async fn insert_each<T: Record>(
        &self,
        stmt: &Statement,
        records: &mut [T],
    ) -> Result<usize, SqlHandleError> {
        let mut inserted = 0;
        for record in records.iter_mut() {
            inserted += self.insert_with(stmt, record).await?;
        }
        Ok(inserted)
    }

    /// Insert when the primary key is zero or absent from the table,
    /// otherwise overwrite every column of the stored row.
    ///
    /// # Errors
    /// Engine errors propagate.
    pub async fn save<T: Record>(
        &self,
        record: &mut T,
        opts: &[QueryOption],
    ) -> Result<(), SqlHandleError> {
        let stmt = self.write_statement::<T>(opts);
        let pk = stmt.primary_key_column().to_owned();
        let Some(key) = record::primary_key(&*record)? else {
            self.insert_with(&stmt, record).await?;
            return Ok(());
        };

        let values = record::columns(&*record)?;
        let assignments: Vec<(String, RowValues)> = values
            .iter()
            .filter(|(column, _)| *column != pk)
            .cloned()
            .collect();
        if !assignments.is_empty() {
            let update = render_update(&stmt.clone().where_eq(&pk, key), &assignments)?;
            if self.run(&update).await? > 0 {
                return Ok(());
            }
        }
        let upsert = render_upsert(&stmt, &values)?;
        self.fetch(&upsert).await?;
        Ok(())
    }

    /// Update the non-zero fields of `record` on every matching row. A
    /// non-zero primary key on `record` restricts the update to that row.
    ///
    /// # Errors
    /// `NoRowsAffected` when nothing matched (or nothing was left to set),
    /// `MissingWhereClause` when no condition restricts the update.
    pub async fn updates<T: Record>(
        &self,
        record: &T,
        opts: &[QueryOption],
    ) -> Result<usize, SqlHandleError> {
        let mut stmt = self.write_statement::<T>(opts);
        let pk = stmt.primary_key_column().to_owned();
        let mut assignments = Vec::new();
        for (column, value) in record::columns(record)? {
            if column == pk {
                if !value.is_zero() {
                    stmt = stmt.where_eq(&pk, value);
                }
            } else if !value.is_zero() {
                assignments.push((column, value));
            }
        }
        if assignments.is_empty() {
            return Err(SqlHandleError::NoRowsAffected);
        }
        self.run_update(&stmt, &assignments).await
    }

    /// Update the given columns, zero values included, on every matching
    /// row of the bound table.
    ///
    /// # Errors
    /// As [`updates`](Handle::updates), plus `MissingTable` when no table is
    /// bound.
    pub async fn updates_map<I, K, V>(
        &self,
        values: I,
        opts: &[QueryOption],
    ) -> Result<usize, SqlHandleError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<RowValues>,
    {
        let assignments: Vec<(String, RowValues)> = values
            .into_iter()
            .map(|(column, value)| (column.into(), value.into()))
            .collect();
        if assignments.is_empty() {
            return Err(SqlHandleError::NoRowsAffected);
        }
        self.run_update(&self.build_options(opts), &assignments).await
    }

    /// Set one column on every matching row of the bound table.
    ///
    /// # Errors
    /// As [`updates_map`](Handle::updates_map).
    pub async fn update(
        &self,
        column: &str,
        value: impl Into<RowValues>,
        opts: &[QueryOption],
    ) -> Result<usize, SqlHandleError> {
        let assignments = [(column.to_owned(), value.into())];
        self.run_update(&self.build_options(opts), &assignments).await
    }

    async fn run_update(
        &self,
        stmt: &Statement,
        assignments: &[(String, RowValues)],
    ) -> Result<usize, SqlHandleError> {
        let compiled = render_update(stmt, assignments)?;
        match self.run(&compiled).await? {
            0 => Err(SqlHandleError::NoRowsAffected),
            affected => Ok(affected),
        }
    }

    /// Delete the matching rows. A non-zero primary key on `record`
    /// restricts the delete to that row.
    ///
    /// Deleting nothing is not an error: unlike the update family, zero
    /// affected rows returns `Ok(0)`.
    ///
    /// # Errors
    /// `MissingWhereClause` when no condition restricts the delete.
    pub async fn delete<T: Record>(
        &self,
        record: &T,
        opts: &[QueryOption],
    ) -> Result<usize, SqlHandleError> {
        let mut stmt = self.write_statement::<T>(opts);
        if let Some(key) = record::primary_key(record)? {
            stmt = stmt.where_eq(T::PRIMARY_KEY, key);
        }
        let compiled = render_delete(&stmt)?;
        self.run(&compiled).await
    }
}
