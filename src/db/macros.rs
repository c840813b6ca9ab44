//! Declarative macros shared by the database layer.
//!
//! `impl_db_dispatch!` generates the per-driver match over [`DbPool`](crate::db::DbPool)
//! and `params!` builds a parameter list from heterogeneous values.

/// Macro for generating database dispatch match arms.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(pool, {
///     MySql(p) => do_mysql(p),
///     Postgres(p) => do_postgres(p),
///     SQLite(p) => do_sqlite(p),
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($pool:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $pool {
            $(
                $crate::db::pool::DbPool::$variant($p) => $body,
            )+
        }
    };
}

/// Build a `Vec<QueryParam>` from values convertible into [`QueryParam`](crate::db::QueryParam).
///
/// ```ignore
/// router.execute("UPDATE product SET name = ? WHERE id = ?", &params!["Boots", 7]).await?;
/// ```
#[macro_export]
macro_rules! params {
    () => {
        ::std::vec::Vec::<$crate::db::QueryParam>::new()
    };
    ($($value:expr),+ $(,)?) => {
        ::std::vec![$($crate::db::QueryParam::from($value)),+]
    };
}

pub use impl_db_dispatch;
pub use params;

#[cfg(test)]
mod tests {
    use crate::db::QueryParam;

    #[test]
    fn test_params_macro() {
        let values = params![1, "two", 3.5, true, None::<i64>];
        assert_eq!(
            values,
            vec![
                QueryParam::Int(1),
                QueryParam::String("two".to_string()),
                QueryParam::Float(3.5),
                QueryParam::Bool(true),
                QueryParam::Null,
            ]
        );
        assert!(params![].is_empty());
    }
}
