//! MariaDB administration through the `mysql` client as root (unix socket auth).
//!
//! SQL is always passed on stdin so passwords never appear in the process
//! list, and registered as redactions so they never reach the run log.

use piprov_command_runner::{CommandRunner, CommandSpec};

use crate::AdapterError;

pub fn validate_identifier(name: &str) -> Result<(), AdapterError> {
    let valid = !name.is_empty()
        && name.len() <= 32
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(AdapterError::InvalidIdentifier(name.to_string()))
    }
}

/// Quotes `value` as a single-quoted SQL string literal.
pub fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}'")
}

/// Statements creating the database and its user, safe to run repeatedly.
pub fn provision_sql(database: &str, user: &str, password: &str) -> Result<String, AdapterError> {
    validate_identifier(database)?;
    validate_identifier(user)?;
    let password = quote(password);
    Ok(format!(
        "CREATE DATABASE IF NOT EXISTS `{database}` CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci;\n\
         CREATE USER IF NOT EXISTS '{user}'@'localhost' IDENTIFIED BY {password};\n\
         ALTER USER '{user}'@'localhost' IDENTIFIED BY {password};\n\
         GRANT ALL PRIVILEGES ON `{database}`.* TO '{user}'@'localhost';\n\
         FLUSH PRIVILEGES;\n"
    ))
}

/// Runs `sql`, masking every string in `secrets`. Returns the result rows.
pub async fn execute(
    runner: &dyn CommandRunner,
    sql: &str,
    secrets: &[&str],
) -> Result<Vec<String>, AdapterError> {
    let spec = secrets.iter().fold(
        CommandSpec::new("mysql")
            .args(["--batch", "--skip-column-names"])
            .named("mysql")
            .stdin(sql),
        |spec, secret| spec.redact(*secret),
    );
    let output = runner.run(&spec).await?;
    Ok(output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

pub async fn database_exists(runner: &dyn CommandRunner, database: &str) -> Result<bool, AdapterError> {
    validate_identifier(database)?;
    let rows = execute(
        runner,
        &format!(
            "SELECT SCHEMA_NAME FROM INFORMATION_SCHEMA.SCHEMATA WHERE SCHEMA_NAME = {};",
            quote(database)
        ),
        &[],
    )
    .await?;
    Ok(rows.iter().any(|r| r == database))
}

pub async fn user_exists(runner: &dyn CommandRunner, user: &str) -> Result<bool, AdapterError> {
    validate_identifier(user)?;
    let rows = execute(
        runner,
        &format!(
            "SELECT User FROM mysql.user WHERE User = {} AND Host = 'localhost';",
            quote(user)
        ),
        &[],
    )
    .await?;
    Ok(rows.iter().any(|r| r == user))
}

/// Whether `user` can log in with `password` and sees `database`.
pub async fn can_login(
    runner: &dyn CommandRunner,
    database: &str,
    user: &str,
    password: &str,
) -> Result<bool, AdapterError> {
    validate_identifier(database)?;
    validate_identifier(user)?;
    let spec = CommandSpec::new("mysql")
        .args(["--batch", "--skip-column-names", "-u", user, database])
        .env("MYSQL_PWD", password)
        .stdin("SELECT 1;")
        .accept_exit_codes(&[0, 1]);
    let output = runner.run(&spec).await?;
    Ok(output.success() && output.stdout_trimmed() == "1")
}

pub async fn provision(
    runner: &dyn CommandRunner,
    database: &str,
    user: &str,
    password: &str,
) -> Result<(), AdapterError> {
    let sql = provision_sql(database, user, password)?;
    execute(runner, &sql, &[password]).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use piprov_command_runner::test_utils::MockRunner;

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("wordpress").is_ok());
        assert!(validate_identifier("wp`; DROP").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote("it's"), "'it\\'s'");
        assert_eq!(quote("a\\b"), "'a\\\\b'");
    }

    #[test]
    fn test_provision_sql() {
        let sql = provision_sql("wordpress", "wp", "s3cr3t").unwrap();
        assert!(sql.contains("CREATE DATABASE IF NOT EXISTS `wordpress`"));
        assert!(sql.contains("CREATE USER IF NOT EXISTS 'wp'@'localhost' IDENTIFIED BY 's3cr3t'"));
        assert!(sql.contains("GRANT ALL PRIVILEGES ON `wordpress`.* TO 'wp'@'localhost'"));
        assert!(provision_sql("word press", "wp", "x").is_err());
    }

    #[tokio::test]
    async fn test_provision_sends_sql_on_stdin_redacted() {
        let runner = MockRunner::new();
        provision(&runner, "wordpress", "wp", "hunter2hunter2").await.unwrap();

        let spec = &runner.specs()[0];
        assert!(!spec.args.iter().any(|a| a.contains("hunter2")));
        assert!(spec.options.stdin.as_deref().unwrap().contains("hunter2hunter2"));
        assert_eq!(spec.redacted("pw hunter2hunter2"), "pw ********");
    }

    #[tokio::test]
    async fn test_database_exists() {
        let runner = MockRunner::new();
        runner.on("mysql", 0, "wordpress\n");
        assert!(database_exists(&runner, "wordpress").await.unwrap());
        assert!(!database_exists(&runner, "other").await.unwrap());
    }
}
