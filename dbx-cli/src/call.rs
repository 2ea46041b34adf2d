//! Method and property commands: call, get, get-all, managed-objects.

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use dbx::{Body, Connection, Message, ObjectPath, Type, Value, properties};
use dbx_proto::Array;

use crate::{OutputFormat, render};

/// Arguments for `dbx call`.
///
/// Usage: `dbx call DEST PATH IFACE METHOD [TYPE:VALUE...]`
#[derive(clap::Args)]
pub struct CallArgs {
    /// Destination bus name.
    pub destination: String,

    /// Object path.
    pub path: String,

    /// Interface name.
    pub interface: String,

    /// Method name.
    pub method: String,

    /// Arguments as `TYPE:VALUE`, e.g. `s:hello`, `u:42`, `as:a,b`.
    #[arg(allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// Arguments for `dbx get`.
#[derive(clap::Args)]
pub struct GetArgs {
    /// Destination bus name.
    pub destination: String,
    /// Object path.
    pub path: String,
    /// Interface owning the property.
    pub interface: String,
    /// Property name.
    pub property: String,
}

/// Arguments for `dbx get-all`.
#[derive(clap::Args)]
pub struct GetAllArgs {
    /// Destination bus name.
    pub destination: String,
    /// Object path.
    pub path: String,
    /// Interface whose properties to read.
    pub interface: String,
}

/// Arguments for `dbx managed-objects`.
#[derive(clap::Args)]
pub struct ManagedObjectsArgs {
    /// Destination bus name.
    pub destination: String,
    /// Path of the object manager.
    #[arg(default_value = "/")]
    pub path: String,
}

pub async fn call(conn: &Connection, args: &CallArgs, format: OutputFormat) -> Result<()> {
    let path = object_path(&args.path)?;
    let values = args
        .args
        .iter()
        .map(String::as_str)
        .map(parse_arg)
        .collect::<Result<Vec<_>>>()?;
    let msg = Message::method_call(path, args.method.as_str())
        .with_interface(args.interface.as_str())
        .with_destination(args.destination.as_str())
        .with_body(Body::from_values(&values)?);
    let reply = conn
        .call(msg)
        .await
        .with_context(|| format!("calling {}.{}", args.interface, args.method))?;
    let body = reply.decoder().get_values().context("decoding reply")?;
    print_values(&body, format)
}

pub async fn get(conn: &Connection, args: &GetArgs, format: OutputFormat) -> Result<()> {
    let path = object_path(&args.path)?;
    let value = properties::get_property(conn, Some(args.destination.as_str()), &path, &args.interface, &args.property)
        .await
        .with_context(|| format!("reading {}.{}", args.interface, args.property))?;
    print_values(std::slice::from_ref(value.flatten()), format)
}

pub async fn get_all(conn: &Connection, args: &GetAllArgs, format: OutputFormat) -> Result<()> {
    let path = object_path(&args.path)?;
    let props = properties::get_all_properties(conn, Some(args.destination.as_str()), &path, &args.interface)
        .await
        .with_context(|| format!("reading properties of {}", args.interface))?;
    let props: BTreeMap<String, Value> = props.into_iter().collect();

    if matches!(format, OutputFormat::Json) {
        println!("{}", serde_json::to_string_pretty(&props)?);
        return Ok(());
    }
    for (name, value) in &props {
        println!("{name:<30} {}", render::value(value.flatten()));
    }
    Ok(())
}

pub async fn managed_objects(conn: &Connection, args: &ManagedObjectsArgs, format: OutputFormat) -> Result<()> {
    let path = object_path(&args.path)?;
    let objects = properties::get_managed_objects(conn, Some(args.destination.as_str()), &path)
        .await
        .with_context(|| format!("listing objects below {path}"))?;

    if matches!(format, OutputFormat::Json) {
        println!("{}", serde_json::to_string_pretty(&objects)?);
        return Ok(());
    }
    if objects.is_empty() {
        println!("No objects.");
        return Ok(());
    }
    for (object, interfaces) in &objects {
        println!("{object}");
        for (interface, props) in interfaces {
            println!("  {interface}");
            for (name, value) in props {
                println!("    {name:<26} {}", render::value(value.flatten()));
            }
        }
    }
    Ok(())
}

fn print_values(values: &[Value], format: OutputFormat) -> Result<()> {
    if matches!(format, OutputFormat::Json) {
        println!("{}", serde_json::to_string_pretty(values)?);
        return Ok(());
    }
    for v in values {
        println!("{}", render::value(v));
    }
    Ok(())
}

fn object_path(text: &str) -> Result<ObjectPath> {
    ObjectPath::new(text).with_context(|| format!("invalid object path {text:?}"))
}

/// Parses one `TYPE:VALUE` argument.
///
/// Basic types take their usual text form. Arrays of a basic type take a
/// comma-separated list (`as:a,b`, `au:` for an empty one). A variant wraps
/// another argument (`v:u:5`).
pub fn parse_arg(arg: &str) -> Result<Value> {
    let Some((sig, text)) = arg.split_once(':') else {
        bail!("argument {arg:?} is not TYPE:VALUE");
    };
    if sig == "v" {
        return Ok(Value::Variant(Box::new(parse_arg(text)?)));
    }
    let ty = Type::parse_single(sig).with_context(|| format!("invalid type {sig:?}"))?;
    match ty {
        Type::Array(element) if element.is_basic() => {
            let items = if text.is_empty() {
                Vec::new()
            } else {
                text.split(',').map(|t| parse_basic(&element, t)).collect::<Result<_>>()?
            };
            Ok(Value::Array(Array::new(*element, items)?))
        }
        basic if basic.is_basic() => parse_basic(&basic, text),
        other => bail!("type {other} cannot be given on the command line"),
    }
}

fn parse_basic(ty: &Type, text: &str) -> Result<Value> {
    let value = match ty {
        Type::Byte => Value::Byte(text.parse()?),
        Type::Bool => Value::Bool(match text {
            "true" | "1" => true,
            "false" | "0" => false,
            _ => bail!("invalid boolean {text:?}"),
        }),
        Type::Int16 => Value::Int16(text.parse()?),
        Type::UInt16 => Value::UInt16(text.parse()?),
        Type::Int32 => Value::Int32(text.parse()?),
        Type::UInt32 => Value::UInt32(text.parse()?),
        Type::Int64 => Value::Int64(text.parse()?),
        Type::UInt64 => Value::UInt64(text.parse()?),
        Type::Double => Value::Double(text.parse()?),
        Type::Str => Value::Str(text.to_owned()),
        Type::ObjectPath => Value::ObjectPath(object_path(text)?),
        Type::Signature => Value::Signature(text.parse()?),
        _ => bail!("type {ty} cannot be given on the command line"),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_arguments() {
        assert_eq!(parse_arg("s:hello").unwrap(), Value::from("hello"));
        assert_eq!(parse_arg("s:").unwrap(), Value::from(""));
        assert_eq!(parse_arg("s:a:b").unwrap(), Value::from("a:b"));
        assert_eq!(parse_arg("i:-3").unwrap(), Value::Int32(-3));
        assert_eq!(parse_arg("t:42").unwrap(), Value::UInt64(42));
        assert_eq!(parse_arg("b:true").unwrap(), Value::Bool(true));
        assert_eq!(
            parse_arg("o:/org/example").unwrap(),
            Value::ObjectPath(ObjectPath::new("/org/example").unwrap())
        );
    }

    #[test]
    fn arrays_and_variants() {
        let Value::Array(a) = parse_arg("as:a,b").unwrap() else {
            panic!("expected an array");
        };
        assert_eq!(a.items(), [Value::from("a"), Value::from("b")]);
        let Value::Array(empty) = parse_arg("au:").unwrap() else {
            panic!("expected an array");
        };
        assert!(empty.items().is_empty());

        let v = parse_arg("v:u:5").unwrap();
        assert_eq!(v, Value::Variant(Box::new(Value::UInt32(5))));
        assert_eq!(v.signature().as_str(), "v");
    }

    #[test]
    fn rejected_arguments() {
        assert!(parse_arg("hello").is_err());
        assert!(parse_arg("u:-1").is_err());
        assert!(parse_arg("b:yes").is_err());
        assert!(parse_arg("(ii):1").is_err());
        assert!(parse_arg("o:not/a/path").is_err());
        assert!(parse_arg("q:70000").is_err());
    }
}
