//! Converts engine values into JSON and thrown values into error text.

use rquickjs::{Coerced, Ctx, Error, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializationFailure {
    pub detail: String,
}

/// `undefined` is "no value" and not a failure. Anything `JSON.stringify`
/// rejects, or yields nothing for, is a [`SerializationFailure`].
pub fn normalize<'js>(
    ctx: &Ctx<'js>,
    value: Value<'js>,
) -> Result<Option<serde_json::Value>, SerializationFailure> {
    if value.is_undefined() {
        return Ok(None);
    }
    let type_name = value.type_name();
    let text = match ctx.json_stringify(value) {
        Ok(Some(text)) => text.to_string().map_err(engine_failure)?,
        Ok(None) => {
            return Err(SerializationFailure { detail: format!("unsupported type: {type_name}") })
        }
        Err(Error::Exception) => {
            let thrown = ctx.catch();
            return Err(SerializationFailure { detail: describe_thrown(&thrown) });
        }
        Err(e) => return Err(engine_failure(e)),
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| SerializationFailure { detail: e.to_string() })
}

fn engine_failure(e: Error) -> SerializationFailure {
    SerializationFailure { detail: e.to_string() }
}

/// `Name: message` for Error objects, `Uncaught <value>` for anything else
/// a script can throw.
pub fn describe_thrown(value: &Value<'_>) -> String {
    if value.is_error() {
        if let Some(obj) = value.as_object() {
            let name = obj
                .get::<_, Option<String>>("name")
                .ok()
                .flatten()
                .unwrap_or_else(|| "Error".to_string());
            let message = obj.get::<_, Option<String>>("message").ok().flatten();
            return match message {
                Some(message) if !message.is_empty() => format!("{name}: {message}"),
                _ => name,
            };
        }
    }
    match value.get::<Coerced<String>>() {
        Ok(Coerced(text)) => format!("Uncaught {text}"),
        Err(_) => format!("Uncaught {}", value.type_name()),
    }
}
