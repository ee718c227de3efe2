//! Proxy conformance suite
//!
//! [`all_tests`] exercises proxy parsing, stringification, builders,
//! comparison and invocation against a server hosting `MyDerivedClassI`
//! at identity `test`. Each section prints `testing <section>... ok`.

mod servant;

use std::collections::HashSet;
use std::io::Write;
use std::panic::Location;

use async_trait::async_trait;
use colored::Colorize;
use serde_json::{json, Value};

use crate::common::{Error, ErrorKind, Result};
use crate::harness::TestSuite;
use crate::rpc::{
    Communicator, Context, Endpoint, Identity, InvocationMode, ObjectPrx, OperationMode,
    OBJECT_TYPE_ID,
};
use crate::schema::Schema;

pub use servant::MyDerivedClassI;

pub const MY_CLASS: &str = "MyClass";
pub const MY_DERIVED_CLASS: &str = "MyDerivedClass";

/// Property naming the proxy of the object under test
pub const PROXY_PROPERTY: &str = "Test.Proxy";

/// Used when `Test.Proxy` is not set
pub const DEFAULT_PROXY: &str = "test:default -p 12010 -t 10000";

/// Typed proxy for `::Test::MyClass`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MyClassPrx(ObjectPrx);

impl MyClassPrx {
    pub const TYPE_ID: &'static str = "::Test::MyClass";

    pub async fn checked_cast(proxy: &ObjectPrx) -> Result<Option<Self>> {
        Ok(proxy.checked_cast(Self::TYPE_ID).await?.map(Self))
    }

    pub fn unchecked_cast(proxy: ObjectPrx) -> Self {
        Self(proxy)
    }

    pub fn proxy(&self) -> &ObjectPrx {
        &self.0
    }

    /// Ask the server to shut down
    pub async fn shutdown(&self) -> Result<()> {
        self.0
            .invoke("shutdown", OperationMode::Normal, Value::Null)
            .await
            .map(|_| ())
    }

    /// Context the server received with this request
    pub async fn get_context(&self) -> Result<Context> {
        let reply = self
            .0
            .invoke("getContext", OperationMode::Idempotent, Value::Null)
            .await?;
        Ok(serde_json::from_value(reply)?)
    }

    /// Like [`MyClassPrx::get_context`] with an explicit request context
    pub async fn get_context_with(&self, context: &Context) -> Result<Context> {
        let reply = self
            .0
            .invoke_with_context("getContext", OperationMode::Idempotent, Value::Null, context)
            .await?;
        Ok(serde_json::from_value(reply)?)
    }
}

/// Typed proxy for `::Test::MyDerivedClass`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MyDerivedClassPrx(MyClassPrx);

impl MyDerivedClassPrx {
    pub const TYPE_ID: &'static str = "::Test::MyDerivedClass";
    pub(crate) const ECHO_PARAM: &'static str = "obj";

    pub async fn checked_cast(proxy: &ObjectPrx) -> Result<Option<Self>> {
        Ok(proxy
            .checked_cast(Self::TYPE_ID)
            .await?
            .map(|p| Self(MyClassPrx(p))))
    }

    pub fn base(&self) -> &MyClassPrx {
        &self.0
    }

    pub fn proxy(&self) -> &ObjectPrx {
        self.0.proxy()
    }

    /// Send a proxy to the server and get it back
    pub async fn echo(&self, obj: Option<&ObjectPrx>) -> Result<Option<ObjectPrx>> {
        let mut params = serde_json::Map::new();
        params.insert(Self::ECHO_PARAM.to_string(), json!(obj.map(|p| p.to_string())));
        let reply = self
            .proxy()
            .invoke("echo", OperationMode::Normal, Value::Object(params))
            .await?;
        match reply {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(self.proxy().sibling(&s)?)),
            other => Err(Error::Protocol(format!("echo returned {other}"))),
        }
    }
}

/// Suite-side check, failing with the caller's location and `what`
#[track_caller]
fn check(condition: bool, what: &str) -> Result<()> {
    if condition {
        return Ok(());
    }
    let location = Location::caller();
    Err(Error::TestAssertion(format!(
        "{} ({}:{})",
        what,
        location.file(),
        location.line()
    )))
}

fn section(name: &str) {
    print!("testing {}... ", name);
    let _ = std::io::stdout().flush();
}

fn ok() {
    println!("{}", "ok".green());
}

/// Run every section against the object named by `Test.Proxy`
///
/// Returns a proxy to the object so the caller can shut the server down.
pub async fn all_tests(
    communicator: &Communicator,
    schema: &Schema,
    collocated: bool,
) -> Result<MyClassPrx> {
    let properties = communicator.properties();
    let reference = properties.get_or(PROXY_PROPERTY, DEFAULT_PROXY).to_string();

    section("stringToProxy");
    string_to_proxy(communicator)?;
    ok();

    section("proxyToString");
    proxy_to_string(communicator, &reference)?;
    ok();

    section("propertyToProxy");
    property_to_proxy(communicator, &reference)?;
    ok();

    section("proxy methods");
    proxy_methods(communicator, &reference)?;
    ok();

    section("proxy comparison");
    proxy_comparison(communicator)?;
    ok();

    section("checked cast");
    let base = communicator.string_to_proxy(&reference)?;
    let cl = MyClassPrx::checked_cast(&base)
        .await?
        .ok_or_else(|| Error::TestAssertion("checked cast to MyClass failed".to_string()))?;
    let derived = MyDerivedClassPrx::checked_cast(cl.proxy())
        .await?
        .ok_or_else(|| Error::TestAssertion("checked cast to MyDerivedClass failed".to_string()))?;
    check(cl.proxy() == &base, "cast proxy equals base")?;
    check(derived.proxy() == &base, "derived proxy equals base")?;
    check(
        MyClassPrx::checked_cast(&base.with_facet("missing")).await?.is_none(),
        "cast to a missing facet",
    )?;
    check(
        base.checked_cast("::Test::Unknown").await?.is_none(),
        "cast to an unknown type",
    )?;
    ok();

    section("checked cast with context");
    checked_cast_with_context(&base, &cl).await?;
    ok();

    section("built-in operations");
    builtin_operations(&base, schema).await?;
    ok();

    section("not-exist errors");
    not_exist_errors(&base).await?;
    ok();

    section("oneway");
    oneway(&base).await?;
    ok();

    section("echo");
    let echoed = derived.echo(Some(&base)).await?;
    check(echoed.as_ref() == Some(&base), "echo returns the same proxy")?;
    check(derived.echo(None).await?.is_none(), "echo of no proxy")?;
    ok();

    if !collocated {
        section("connection caching");
        connection_caching(communicator, &base).await?;
        ok();
    }

    Ok(cl)
}

fn string_to_proxy(communicator: &Communicator) -> Result<()> {
    let parse = |s: &str| communicator.string_to_proxy(s);
    let identity = |s: &str| parse(s).map(|p| p.identity().clone());

    for s in ["test", " test ", " test", "test "] {
        check(identity(s)? == Identity::new("test"), s)?;
    }
    check(identity("\"test -f facet\"")?.name == "test -f facet", "quoted identity")?;
    check(
        identity("\"test -f facet@test\"")?.name == "test -f facet@test",
        "quoted identity with @",
    )?;
    check(identity("test\\040test")?.name == "test test", "octal escape")?;
    check(identity("test\\40test")?.name == "test test", "short octal escape")?;
    check(
        identity("category/test")? == Identity::with_category("test", "category"),
        "category",
    )?;
    check(
        identity("cat\\/egory/test")? == Identity::with_category("test", "cat/egory"),
        "escaped slash",
    )?;

    let indirect = parse("test@adapter")?;
    check(indirect.adapter_id() == "adapter", "adapter id")?;
    check(indirect.endpoints().is_empty(), "adapter id has no endpoints")?;
    check(
        parse("category/test@adapter:tcp")?.adapter_id() == "adapter:tcp",
        "adapter id with colon",
    )?;
    let quoted = parse("\"category 1/test\"@adapter")?;
    check(
        quoted.identity() == &Identity::with_category("test", "category 1"),
        "quoted category",
    )?;

    check(parse("test -f \"facet x\"")?.facet() == "facet x", "quoted facet")?;
    let faceted = parse("test -f facet@test")?;
    check(faceted.facet() == "facet", "facet before adapter")?;
    check(faceted.adapter_id() == "test", "adapter after facet")?;

    check(parse("test -t")?.is_twoway(), "twoway option")?;
    check(parse("test -o")?.is_oneway(), "oneway option")?;
    check(parse("test -s")?.is_secure(), "secure option")?;

    let infinite = parse("test:tcp -p 12010 -t infinite")?;
    check(infinite.endpoints()[0].timeout().is_none(), "infinite timeout")?;

    for bad in [
        "test test",
        "test\\777",
        "test -f facet @test @test",
        "test -x",
        "test -f",
        "test -t -o",
        "test:tcp -p 12010 -t 0",
        "test::tcp",
        "a/b/c",
        "\"test",
    ] {
        let result = parse(bad);
        check(result.is_err(), bad)?;
        if let Err(e) = result {
            check(e.kind() == ErrorKind::Local, "parse errors are local")?;
        }
    }
    Ok(())
}

fn proxy_to_string(communicator: &Communicator, reference: &str) -> Result<()> {
    let b1 = communicator.string_to_proxy(reference)?;
    let round_trip = communicator.string_to_proxy(&communicator.proxy_to_string(&b1))?;
    check(round_trip == b1, "round trip of the test proxy")?;

    let full = communicator.string_to_proxy("test -f facet -o -s:tcp -p 12010")?;
    check(
        communicator.proxy_to_string(&full) == "test -f facet -o -s:tcp -h 127.0.0.1 -p 12010",
        "stringified options",
    )?;

    for variant in [
        b1.with_identity(Identity::with_category("test", "cat/egory")),
        b1.with_identity(Identity::new("with space")),
        b1.with_facet("a facet"),
        b1.oneway(),
        b1.with_secure(true),
        b1.with_adapter_id("Test Adapter"),
    ] {
        let s = communicator.proxy_to_string(&variant);
        check(communicator.string_to_proxy(&s)? == variant, &s)?;
    }

    check(
        Identity::with_category("test", "cat/egory").to_string() == "cat\\/egory/test",
        "identity escaping",
    )?;
    Ok(())
}

fn property_to_proxy(communicator: &Communicator, reference: &str) -> Result<()> {
    let prefix = "Test.Prx";
    communicator.set_property(prefix, reference);
    let b1 = communicator
        .property_to_proxy(prefix)?
        .ok_or_else(|| Error::TestAssertion(format!("{prefix} not set")))?;
    check(b1.identity() == &Identity::new("test"), "identity from property")?;
    check(!b1.is_secure(), "not secure by default")?;
    check(b1.context().is_empty(), "no context by default")?;

    communicator.set_property(&format!("{prefix}.Secure"), "1");
    check(
        communicator.property_to_proxy(prefix)?.is_some_and(|p| p.is_secure()),
        "secure from property",
    )?;
    communicator.set_property(&format!("{prefix}.Secure"), "");

    communicator.set_property(&format!("{prefix}.Context.c1"), "TEST1");
    communicator.set_property(&format!("{prefix}.Context.c2"), "TEST2");
    let with_context = communicator
        .property_to_proxy(prefix)?
        .ok_or_else(|| Error::TestAssertion(format!("{prefix} not set")))?;
    check(with_context.context().len() == 2, "context from properties")?;
    check(
        with_context.context().get("c1").map(String::as_str) == Some("TEST1"),
        "context value from property",
    )?;
    communicator.set_property(&format!("{prefix}.Context.c1"), "");
    communicator.set_property(&format!("{prefix}.Context.c2"), "");

    communicator.set_property(prefix, "");
    check(
        communicator.property_to_proxy(prefix)?.is_none(),
        "unset property gives no proxy",
    )?;
    Ok(())
}

fn proxy_methods(communicator: &Communicator, reference: &str) -> Result<()> {
    let base = communicator.string_to_proxy(reference)?;

    check(
        base.with_identity(Identity::new("other")).identity() == &Identity::new("other"),
        "with_identity",
    )?;
    check(base.with_facet("facet").facet() == "facet", "with_facet")?;
    check(base.oneway().reference().mode == InvocationMode::Oneway, "oneway")?;
    check(base.oneway().twoway().is_twoway(), "twoway")?;
    check(base.with_secure(true).is_secure(), "with_secure")?;
    check(!base.with_secure(true).with_secure(false).is_secure(), "with_secure(false)")?;

    let timed = base.with_timeout(Some(1000));
    check(
        timed.endpoints().iter().all(|e| e.timeout() == Some(1000)),
        "with_timeout",
    )?;
    check(
        base.with_timeout(None).endpoints().iter().all(|e| e.timeout().is_none()),
        "with_timeout(None)",
    )?;

    let indirect = base.with_adapter_id("TestAdapter");
    check(indirect.adapter_id() == "TestAdapter", "with_adapter_id")?;
    check(indirect.endpoints().is_empty(), "adapter id clears endpoints")?;
    let direct = indirect.with_endpoints(base.endpoints().to_vec());
    check(direct == base, "with_endpoints restores the proxy")?;

    let mut context = Context::new();
    context.insert("one".to_string(), "hello".to_string());
    check(base.with_context(context.clone()).context() == &context, "with_context")?;
    check(base.context().is_empty(), "builders leave the original unchanged")?;
    Ok(())
}

fn proxy_comparison(communicator: &Communicator) -> Result<()> {
    let p = |s: &str| communicator.string_to_proxy(s);

    check(p("foo")? == p("foo")?, "same identity")?;
    check(p("foo")? != p("foo2")?, "different identity")?;
    check(p("foo")? < p("foo2")?, "identity ordering")?;
    check(p("foo")? != p("category/foo")?, "different category")?;
    check(p("foo -f facet")? != p("foo -f facet1")?, "different facet")?;
    check(p("foo")? != p("foo -o")?, "different mode")?;
    check(p("foo")? < p("foo -o")?, "mode ordering")?;
    check(p("foo")? != p("foo -s")?, "different secure flag")?;
    check(p("foo:tcp -p 1")? != p("foo:tcp -p 2")?, "different endpoints")?;
    check(p("foo@a")? != p("foo@b")?, "different adapter id")?;

    let mut context = Context::new();
    context.insert("k".to_string(), "v".to_string());
    check(p("foo")? != p("foo")?.with_context(context), "different context")?;

    let endpoint = Endpoint::parse("tcp -h 127.0.0.1 -p 1")?;
    check(
        p("foo:tcp -p 1")? == p("foo")?.with_endpoints(vec![endpoint]),
        "builder equals parsed",
    )?;

    let set: HashSet<ObjectPrx> = [p("foo")?, p("foo")?, p("foo -o")?].into_iter().collect();
    check(set.len() == 2, "hashing follows equality")?;
    Ok(())
}

async fn checked_cast_with_context(base: &ObjectPrx, cl: &MyClassPrx) -> Result<()> {
    check(cl.get_context().await?.is_empty(), "no context by default")?;

    let mut context = Context::new();
    context.insert("one".to_string(), "hello".to_string());
    context.insert("two".to_string(), "world".to_string());

    let with_context = MyClassPrx::checked_cast(&base.with_context(context.clone()))
        .await?
        .ok_or_else(|| Error::TestAssertion("checked cast with context failed".to_string()))?;
    check(with_context.get_context().await? == context, "context survives the cast")?;

    let mut other = Context::new();
    other.insert("three".to_string(), "!".to_string());
    check(
        with_context.get_context_with(&other).await? == other,
        "explicit context replaces the proxy context",
    )?;
    Ok(())
}

async fn builtin_operations(base: &ObjectPrx, schema: &Schema) -> Result<()> {
    let derived_id = schema.type_id(MY_DERIVED_CLASS);
    check(schema.type_id(MY_CLASS) == MyClassPrx::TYPE_ID, "MyClass type id")?;
    check(derived_id == MyDerivedClassPrx::TYPE_ID, "MyDerivedClass type id")?;

    base.ping().await?;
    check(base.type_id().await? == derived_id, "rpc_id")?;

    let expected = schema
        .type_ids(&derived_id)
        .ok_or_else(|| Error::Schema(format!("{derived_id} is not defined")))?;
    check(base.type_ids().await? == expected, "rpc_ids")?;
    for id in &expected {
        check(base.is_a(id).await?, id)?;
    }
    check(base.is_a(OBJECT_TYPE_ID).await?, "rpc_isA of the base type")?;
    check(!base.is_a("::Test::Unknown").await?, "rpc_isA of an unknown type")?;

    let get_context = schema
        .operation(&derived_id, "getContext")
        .ok_or_else(|| Error::Schema("getContext is not defined".to_string()))?;
    check(get_context.idempotent, "getContext is idempotent")?;
    check(
        schema.operation(&derived_id, "shutdown").is_some_and(|op| !op.idempotent),
        "shutdown is not idempotent",
    )?;
    Ok(())
}

async fn not_exist_errors(base: &ObjectPrx) -> Result<()> {
    let missing = base.with_identity(Identity::new("nonexistent")).ping().await;
    check(
        matches!(missing, Err(Error::ObjectNotExist { .. })),
        "missing object",
    )?;

    let missing = base.with_facet("nonexistent").ping().await;
    check(
        matches!(missing, Err(Error::FacetNotExist { .. })),
        "missing facet",
    )?;

    let missing = base
        .invoke("noSuchOperation", OperationMode::Normal, Value::Null)
        .await;
    check(
        matches!(missing, Err(Error::OperationNotExist { .. })),
        "missing operation",
    )?;
    if let Err(e) = missing {
        check(e.kind() == ErrorKind::Remote, "not-exist errors are remote")?;
    }
    Ok(())
}

async fn oneway(base: &ObjectPrx) -> Result<()> {
    let oneway = base.oneway();
    oneway.ping().await?;
    check(
        matches!(oneway.type_id().await, Err(Error::TwowayOnly(_))),
        "rpc_id needs twoway",
    )?;
    check(
        matches!(oneway.type_ids().await, Err(Error::TwowayOnly(_))),
        "rpc_ids needs twoway",
    )?;
    let reply = oneway
        .invoke("getContext", OperationMode::Idempotent, Value::Null)
        .await?;
    check(reply.is_null(), "oneway invocation returns nothing")?;

    // The twoway request after the oneway ones confirms they were consumed.
    base.ping().await?;
    Ok(())
}

async fn connection_caching(communicator: &Communicator, base: &ObjectPrx) -> Result<()> {
    let count = communicator.connection_count().await;
    check(count >= 1, "connection established")?;

    let mut context = Context::new();
    context.insert("k".to_string(), "v".to_string());
    base.with_context(context).ping().await?;
    base.with_timeout(Some(20_000)).ping().await?;
    check(
        communicator.connection_count().await == count,
        "proxies to the same address share a connection",
    )?;

    let unreachable = communicator
        .string_to_proxy("test:tcp -h 127.0.0.1 -p 1 -t 2000")?
        .ping()
        .await;
    check(
        unreachable.is_err_and(|e| e.kind() == ErrorKind::Remote),
        "unreachable endpoint",
    )?;
    Ok(())
}

/// Adapts [`all_tests`] to the harness
///
/// Runs every section, then asks the server to shut down.
pub struct ProxySuite {
    schema: Schema,
    collocated: bool,
}

impl ProxySuite {
    pub fn new(schema: Schema, collocated: bool) -> Self {
        Self { schema, collocated }
    }
}

#[async_trait]
impl TestSuite<Communicator> for ProxySuite {
    async fn run(&mut self, communicator: &Communicator) -> Result<bool> {
        let my_class = all_tests(communicator, &self.schema, self.collocated).await?;
        my_class.shutdown().await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Properties;
    use crate::rpc::InitializationData;
    use std::sync::Arc;

    fn schema() -> Schema {
        Schema::parse(include_str!("../../schema/Test.yaml")).unwrap()
    }

    fn communicator(properties: Properties) -> Communicator {
        Communicator::initialize(Vec::new(), InitializationData::new(properties)).unwrap()
    }

    async fn serve(communicator: &Communicator) -> String {
        let adapter = communicator
            .create_object_adapter_with_endpoints("TestAdapter", "tcp -h 127.0.0.1 -p 0 -t 10000")
            .unwrap();
        let servant = MyDerivedClassI::new(schema()).unwrap();
        let proxy = adapter.add(Arc::new(servant), Identity::new("test")).unwrap();
        adapter.activate().await.unwrap();
        let endpoint = adapter.endpoints()[0].clone();
        proxy.with_endpoints(vec![endpoint]).to_string()
    }

    #[tokio::test]
    async fn test_suite_against_server() {
        let server = communicator(Properties::new());
        let reference = serve(&server).await;

        let mut properties = Properties::new();
        properties.set(PROXY_PROPERTY, &reference);
        let client = communicator(properties);

        let mut suite = ProxySuite::new(schema(), false);
        assert!(suite.run(&client).await.unwrap());

        server.wait_for_shutdown().await;
        client.destroy().await.unwrap();
        server.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_suite_collocated() {
        let communicator = communicator(Properties::new());
        let reference = serve(&communicator).await;
        communicator.set_property(PROXY_PROPERTY, &reference);

        let mut suite = ProxySuite::new(schema(), true);
        assert!(suite.run(&communicator).await.unwrap());
        assert!(communicator.is_shutdown());
        assert_eq!(communicator.connection_count().await, 0);

        communicator.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_server_fails() {
        let mut properties = Properties::new();
        properties.set(PROXY_PROPERTY, "test:tcp -h 127.0.0.1 -p 1 -t 2000");
        let client = communicator(properties);

        let result = all_tests(&client, &schema(), false).await;
        assert!(result.is_err_and(|e| e.kind() == ErrorKind::Remote));
        client.destroy().await.unwrap();
    }
}
