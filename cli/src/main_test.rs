use super::*;

#[test]
fn field_values_parse_as_json_or_fall_back_to_text() {
    let fields = parse_fields(&["x=3".to_owned(), "name=goblin".to_owned(), "tags=[1,2]".to_owned()])
        .expect("fields");
    assert_eq!(fields.get("x"), Some(&json!(3)));
    assert_eq!(fields.get("name"), Some(&json!("goblin")));
    assert_eq!(fields.get("tags"), Some(&json!([1, 2])));
}

#[test]
fn field_without_key_is_rejected() {
    assert!(matches!(parse_fields(&["=3".to_owned()]), Err(CliError::InvalidField(_))));
    assert!(matches!(parse_fields(&["novalue".to_owned()]), Err(CliError::InvalidField(_))));
}

#[test]
fn only_probe_and_sync_skip_login() {
    assert!(!Command::Probe.needs_login());
    assert!(!Command::Sync.needs_login());
    assert!(Command::Users.needs_login());
}

#[test]
fn cli_parses_global_flags_and_subcommand() {
    let cli = Cli::try_parse_from(["dmclient", "--host", "10.0.0.2", "--port", "6000", "send", "chat", "text=hi"])
        .expect("parse");
    assert_eq!(cli.host, "10.0.0.2");
    assert_eq!(cli.port, Some(6000));
    assert!(matches!(cli.command, Command::Send { ref tag, ref fields } if tag == "chat" && fields.len() == 1));
}
