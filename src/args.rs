//! Rewriting of the client's `--host`/`--port` so it connects through the tunnel.

use anyhow::{Context, Result};

/// Client arguments pointed at the tunnel, plus the target they used to name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientArgs {
    pub args: Vec<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Strip `--host`/`--port` (either `--flag value` or `--flag=value`) from
/// `args` and prepend ones for the local endpoint.
pub fn rewrite(args: &[String], local_host: &str, local_port: u16) -> Result<ClientArgs> {
    let mut host = None;
    let mut port = None;
    let mut rest = Vec::with_capacity(args.len());

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(value) = flag_value(arg, "--host", &mut iter)? {
            host = Some(value);
        } else if let Some(value) = flag_value(arg, "--port", &mut iter)? {
            let parsed = value
                .parse::<u16>()
                .with_context(|| format!("Failed in parsing server port '{}'", value))?;
            port = Some(parsed);
        } else {
            rest.push(arg.clone());
        }
    }

    let mut rewritten = vec![
        "--host".to_string(),
        local_host.to_string(),
        "--port".to_string(),
        local_port.to_string(),
    ];
    rewritten.extend(rest);

    Ok(ClientArgs {
        args: rewritten,
        host,
        port,
    })
}

fn flag_value<'a>(
    arg: &str,
    flag: &str,
    rest: &mut impl Iterator<Item = &'a String>,
) -> Result<Option<String>> {
    if arg == flag {
        let value = rest
            .next()
            .with_context(|| format!("{} requires a value", flag))?;
        return Ok(Some(value.clone()));
    }
    Ok(arg
        .strip_prefix(flag)
        .and_then(|tail| tail.strip_prefix('='))
        .map(str::to_string))
}
